//! In-process cluster driven one event at a time, for multi-hop scenarios.

use std::net::SocketAddr;
use std::sync::Arc;

use super::context::NodeContext;
use super::coordinator::CoordinatorNode;
use super::protocol::{ClientRequest, ClientResponse};
use super::proxy::ProxyNode;
use super::server::ServerNode;
use super::types::NodeEvent;
use crate::cluster::types::{Node, NodeId, NodeRole};
use crate::cluster::{ClusterView, Placement, StripeList};
use crate::config::EngineConfig;
use crate::event::{EventHandler, EventQueue};
use crate::persistence::MemoryStorage;
use crate::transport::{LocalTransport, Transport};

const MAX_ROUNDS: usize = 10_000;

struct Member {
    id: NodeId,
    queue: Arc<EventQueue<NodeEvent>>,
    handler: Arc<dyn EventHandler<NodeEvent>>,
}

pub struct LocalCluster {
    pub config: Arc<EngineConfig>,
    pub transport: Arc<LocalTransport>,
    pub placement: Arc<StripeList>,
    pub proxy: Arc<ProxyNode>,
    pub coordinator: Arc<CoordinatorNode>,
    pub servers: Vec<Arc<ServerNode>>,
    members: Vec<Member>,
}

impl LocalCluster {
    /// One proxy, one coordinator and `server_count` servers named
    /// `server-0..`, every one with its own view of the cluster.
    pub fn new(config: EngineConfig, server_count: usize) -> Self {
        let config = Arc::new(config);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let proxy_id = NodeId::from("proxy");
        let coordinator_id = NodeId::from("coordinator");
        let server_ids: Vec<NodeId> = (0..server_count)
            .map(|i| NodeId(format!("server-{}", i)))
            .collect();

        let mut nodes = vec![
            Node::new(proxy_id.clone(), NodeRole::Proxy, addr),
            Node::new(coordinator_id.clone(), NodeRole::Coordinator, addr),
        ];
        nodes.extend(
            server_ids
                .iter()
                .map(|id| Node::new(id.clone(), NodeRole::Server, addr)),
        );

        let placement = Arc::new(
            StripeList::new(
                server_ids.clone(),
                config.list_count,
                config.data_chunks,
                config.parity_chunks,
            )
            .unwrap(),
        );
        let transport = Arc::new(LocalTransport::new());

        let context = |id: &NodeId| {
            let queue = Arc::new(EventQueue::from_config(&config));
            transport.attach(id.clone(), queue.clone());
            let shared: Arc<dyn Transport> = transport.clone();
            let ctx = NodeContext::new(
                id.clone(),
                coordinator_id.clone(),
                config.clone(),
                Arc::new(ClusterView::from_nodes(nodes.clone())),
                placement.clone(),
                shared,
                queue.clone(),
            );
            (ctx, queue)
        };

        let mut members = Vec::new();

        let (ctx, queue) = context(&proxy_id);
        let proxy = Arc::new(ProxyNode::new(ctx));
        members.push(Member {
            id: proxy_id,
            queue,
            handler: proxy.clone(),
        });

        let (ctx, queue) = context(&coordinator_id);
        let coordinator = Arc::new(CoordinatorNode::new(ctx));
        members.push(Member {
            id: coordinator_id.clone(),
            queue,
            handler: coordinator.clone(),
        });

        let mut servers = Vec::new();
        for id in &server_ids {
            let (ctx, queue) = context(id);
            let server = Arc::new(ServerNode::new(ctx, Arc::new(MemoryStorage::new())).unwrap());
            members.push(Member {
                id: id.clone(),
                queue,
                handler: server.clone(),
            });
            servers.push(server);
        }

        Self {
            config,
            transport,
            placement,
            proxy,
            coordinator,
            servers,
            members,
        }
    }

    /// k = 3, m = 1 over four servers and a single stripe list.
    pub fn small() -> Self {
        Self::small_with(|_| {})
    }

    /// `small()` with the config adjusted first.
    pub fn small_with(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let mut config = EngineConfig {
            chunk_size: 64,
            flush_threshold: 8,
            open_slots: 1,
            list_count: 1,
            ..EngineConfig::new(3, 1)
        };
        adjust(&mut config);
        Self::new(config, 4)
    }

    pub fn server_id(&self, index: usize) -> NodeId {
        self.servers[index].id().clone()
    }

    fn member(&self, id: &NodeId) -> &Member {
        self.members
            .iter()
            .find(|member| &member.id == id)
            .unwrap()
    }

    pub fn queue(&self, id: &NodeId) -> Arc<EventQueue<NodeEvent>> {
        self.member(id).queue.clone()
    }

    /// Handles the next queued event of one node. False when it was idle.
    pub fn step(&self, id: &NodeId) -> bool {
        let member = self.member(id);
        match member.queue.try_extract() {
            Some(event) => {
                member.handler.handle(event);
                true
            }
            None => false,
        }
    }

    /// Removes every event queued at a node, holding them back from delivery.
    pub fn take_queued(&self, id: &NodeId) -> Vec<NodeEvent> {
        let queue = &self.member(id).queue;
        std::iter::from_fn(|| queue.try_extract()).collect()
    }

    pub fn redeliver(&self, id: &NodeId, events: Vec<NodeEvent>) {
        let queue = &self.member(id).queue;
        for event in events {
            queue.insert(event).unwrap();
        }
    }

    /// Delivers queued events round-robin, one per node per round, until
    /// every live node is idle.
    pub fn run_until_idle(&self) {
        for _ in 0..MAX_ROUNDS {
            let mut progressed = false;
            for member in &self.members {
                if self.transport.is_down(&member.id) {
                    continue;
                }
                if let Some(event) = member.queue.try_extract() {
                    member.handler.handle(event);
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("cluster did not settle within {} rounds", MAX_ROUNDS);
    }

    pub fn request(&self, request: ClientRequest) -> ClientResponse {
        let mut answer = self.proxy.submit(request).unwrap();
        self.run_until_idle();
        answer.try_recv().expect("request left unanswered")
    }

    pub fn set(&self, key: &str, value: &[u8]) -> ClientResponse {
        self.request(ClientRequest::Set {
            key: key.to_string(),
            value: value.to_vec(),
        })
    }

    pub fn get(&self, key: &str) -> ClientResponse {
        self.request(ClientRequest::Get {
            key: key.to_string(),
        })
    }

    pub fn update(&self, key: &str, offset: u32, value: &[u8]) -> ClientResponse {
        self.request(ClientRequest::Update {
            key: key.to_string(),
            offset,
            value: value.to_vec(),
        })
    }

    pub fn delete(&self, key: &str) -> ClientResponse {
        self.request(ClientRequest::Delete {
            key: key.to_string(),
        })
    }

    /// Seals every open chunk on every live server and lets the seals land.
    pub fn seal_all(&self) {
        for server in &self.servers {
            if !self.transport.is_down(server.id()) {
                server.seal_open_chunks().unwrap();
            }
        }
        self.run_until_idle();
    }

    /// Takes server `index` off the network, drops whatever it had queued,
    /// and has the coordinator announce it unavailable.
    pub fn fail(&self, index: usize) {
        let id = self.server_id(index);
        self.transport.set_down(&id, true);
        self.take_queued(&id);
        self.coordinator.fail_node(&id).unwrap();
        self.run_until_idle();
    }

    pub fn recover(&self, index: usize) {
        let id = self.server_id(index);
        self.transport.set_down(&id, false);
        self.coordinator.recover_node(&id).unwrap();
        self.run_until_idle();
    }

    /// A key the placement puts on data slot `slot`.
    pub fn key_for_slot(&self, slot: u32) -> String {
        self.keys_for_slot(slot, 1).remove(0)
    }

    pub fn keys_for_slot(&self, slot: u32, count: usize) -> Vec<String> {
        (0..)
            .map(|n| format!("key-{}", n))
            .filter(|key| self.placement.place(key).chunk_id == slot)
            .take(count)
            .collect()
    }
}
