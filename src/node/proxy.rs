use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;

use super::context::NodeContext;
use super::protocol::{ClientReply, ClientRequest, ClientResponse, Envelope, Message};
use super::types::{NodeEvent, Op};
use crate::chunk::KeyLocation;
use crate::cluster::Placement;
use crate::cluster::types::{NodeId, NodeStatus};
use crate::degraded::{DegradedLockResult, DegradedOpKind};
use crate::error::{EngineError, ErrorCode, Result};
use crate::event::EventHandler;
use crate::pending::{Handle, HandleArena, PendingIdentifier, PendingTable, PendingType, Settled};

/// A request forwarded to a data server or reconstructor.
#[derive(Debug, Clone)]
struct ServerLeg {
    key: String,
}

/// A degraded-lock request waiting on the coordinator.
#[derive(Debug, Clone)]
struct LockLeg {
    request: ClientRequest,
    location: KeyLocation,
    lost: NodeId,
}

/// One table per operation kind.
#[derive(Debug)]
struct OpTables<T> {
    get: PendingTable<T>,
    set: PendingTable<T>,
    update: PendingTable<T>,
    delete: PendingTable<T>,
}

impl<T> OpTables<T> {
    fn new(kinds: [PendingType; 4], lease: std::time::Duration) -> Self {
        let [get, set, update, delete] = kinds;
        Self {
            get: PendingTable::new(get, lease),
            set: PendingTable::new(set, lease),
            update: PendingTable::new(update, lease),
            delete: PendingTable::new(delete, lease),
        }
    }

    fn table(&self, op: Op) -> &PendingTable<T> {
        match op {
            Op::Get => &self.get,
            Op::Set => &self.set,
            Op::Update => &self.update,
            Op::Delete => &self.delete,
        }
    }

    fn all(&self) -> [(Op, &PendingTable<T>); 4] {
        [
            (Op::Get, &self.get),
            (Op::Set, &self.set),
            (Op::Update, &self.update),
            (Op::Delete, &self.delete),
        ]
    }

    fn len(&self) -> usize {
        self.all().iter().map(|(_, table)| table.len()).sum()
    }
}

/// Routing tier. Application requests are striped onto data servers, or
/// served through a reconstructor when the owning server is not healthy.
///
/// Each application request lives in two tables: the app table keyed by
/// the client's handle, and a server table keyed by the peer the request
/// was forwarded to, whose parent id points back at the app entry.
pub struct ProxyNode {
    ctx: NodeContext,
    clients: Mutex<HandleArena<oneshot::Sender<ClientResponse>>>,
    app: OpTables<ClientRequest>,
    server: OpTables<ServerLeg>,
    locks: PendingTable<LockLeg>,
    /// Where each key written through this proxy lives, needed to address a
    /// lost chunk.
    locations: DashMap<String, KeyLocation>,
}

impl ProxyNode {
    pub fn new(ctx: NodeContext) -> Self {
        let lease = ctx.config.pending_lease();
        Self {
            clients: Mutex::new(HandleArena::new()),
            app: OpTables::new(
                [
                    PendingType::AppGet,
                    PendingType::AppSet,
                    PendingType::AppUpdate,
                    PendingType::AppDelete,
                ],
                lease,
            ),
            server: OpTables::new(
                [
                    PendingType::ServerGet,
                    PendingType::ServerSet,
                    PendingType::ServerUpdate,
                    PendingType::ServerDelete,
                ],
                lease,
            ),
            locks: PendingTable::new(PendingType::DegradedLock, lease),
            locations: DashMap::new(),
            ctx,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.ctx.id
    }

    /// Enqueues an application request; the answer arrives on the receiver.
    pub fn submit(&self, request: ClientRequest) -> Result<oneshot::Receiver<ClientResponse>> {
        let (reply, receiver) = oneshot::channel();
        self.ctx.events.insert(NodeEvent::Client { request, reply })?;
        Ok(receiver)
    }

    /// Submits a request and waits for its answer, bounded by the client timeout.
    pub async fn request(&self, request: ClientRequest) -> ClientResponse {
        let receiver = self.submit(request)?;
        match tokio::time::timeout(self.ctx.config.client_timeout(), receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Err(ErrorCode::Transport),
            Err(_) => Err(ErrorCode::Timeout),
        }
    }

    pub fn cached_location(&self, key: &str) -> Option<KeyLocation> {
        self.locations.get(key).map(|entry| *entry.value())
    }

    pub fn pending_len(&self) -> usize {
        self.app.len() + self.server.len() + self.locks.len()
    }

    fn accept(&self, request: ClientRequest, reply: oneshot::Sender<ClientResponse>) {
        let client = self.clients.lock().insert(reply);
        let op = Op::from(&request);
        let app_id = self.ctx.next_request_id();
        if let Err(e) = self
            .app
            .table(op)
            .try_insert(PendingIdentifier::new(app_id, app_id, client), request.clone())
        {
            tracing::error!("{}", e);
            if let Some(reply) = self.clients.lock().remove(client) {
                let _ = reply.send(Err(e.into()));
            }
            return;
        }
        self.route(app_id, request);
    }

    fn route(&self, app_id: u64, request: ClientRequest) {
        let op = Op::from(&request);
        let placement = self.ctx.placement.place(request.key());
        let target = placement.data_peer().clone();
        if self.ctx.view.is_normal(&target) {
            let message = normal_message(&request);
            self.forward(app_id, op, request.key(), &target, message);
            return;
        }

        let Some(location) = self.cached_location(request.key()) else {
            tracing::warn!(
                "{:?} is {:?} and the location of {:?} is unknown",
                target,
                self.ctx.view.status(&target),
                request.key()
            );
            self.complete(app_id, op, Err(EngineError::NodeUnavailable(target).into()));
            return;
        };
        if op == Op::Set {
            self.complete(app_id, op, Err(EngineError::NodeUnavailable(target).into()));
            return;
        }

        let lock_id = self.ctx.next_request_id();
        let coordinator = self.ctx.coordinator.clone();
        let origin = self.ctx.handle_for(&coordinator);
        let key = request.key().to_string();
        let leg = LockLeg {
            request,
            location,
            lost: target.clone(),
        };
        if let Err(e) = self
            .locks
            .try_insert(PendingIdentifier::new(lock_id, app_id, origin), leg)
        {
            tracing::error!("{}", e);
            self.complete(app_id, op, Err(e.into()));
            return;
        }
        tracing::debug!("Requesting degraded lock for {:?} on {}", key, location.chunk());
        let message = Message::DegradedLock {
            request_id: lock_id,
            location,
            key,
            lost: target,
        };
        if let Err(e) = self.ctx.send(&coordinator, message) {
            tracing::warn!("Coordinator unreachable: {}", e);
            if self.locks.erase(lock_id, Some(origin)).is_ok() {
                self.complete(app_id, op, Err(e.into()));
            }
        }
    }

    /// Sends `message` (whose request id is replaced) to `target` and records
    /// the server leg.
    fn forward(&self, app_id: u64, op: Op, key: &str, target: &NodeId, message: impl FnOnce(u64) -> Message) {
        let request_id = self.ctx.next_request_id();
        let origin = self.ctx.handle_for(target);
        let leg = ServerLeg {
            key: key.to_string(),
        };
        if let Err(e) = self
            .server
            .table(op)
            .try_insert(PendingIdentifier::new(request_id, app_id, origin), leg)
        {
            tracing::error!("{}", e);
            self.complete(app_id, op, Err(e.into()));
            return;
        }
        if let Err(e) = self.ctx.send(target, message(request_id)) {
            tracing::warn!("Failed to forward {:?} to {:?}: {}", key, target, e);
            if self.server.table(op).erase(request_id, Some(origin)).is_ok() {
                self.complete(app_id, op, Err(e.into()));
            }
        }
    }

    fn handle_peer(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        match message {
            Message::GetResponse {
                request_id, result, ..
            } => self.handle_response(&from, request_id, Op::Get, result.map(ClientReply::Value)),
            Message::SetResponse {
                request_id,
                key,
                result,
            } => {
                if let Ok(location) = result {
                    self.locations.insert(key, location);
                }
                self.handle_response(&from, request_id, Op::Set, result.map(ClientReply::Stored))
            }
            Message::UpdateResponse {
                request_id, result, ..
            } => self.handle_response(&from, request_id, Op::Update, result.map(|()| ClientReply::Updated)),
            Message::DeleteResponse {
                request_id,
                key,
                result,
            } => {
                if result.is_ok() {
                    self.locations.remove(&key);
                }
                self.handle_response(&from, request_id, Op::Delete, result.map(|()| ClientReply::Deleted))
            }
            Message::DegradedLockResponse { request_id, result } => {
                self.handle_lock_response(&from, request_id, result)
            }
            Message::NodeStatus {
                node,
                status,
                incarnation,
            } => {
                if self.ctx.view.apply(&node, status, incarnation)
                    && status == NodeStatus::Unavailable
                {
                    self.peer_lost(&node);
                }
            }
            other => tracing::warn!("Proxy ignoring unexpected {}", other.kind()),
        }
    }

    fn handle_response(&self, from: &NodeId, request_id: u64, op: Op, response: ClientResponse) {
        // The server refused a redelivery; the first copy answers for it.
        if response == Err(ErrorCode::DuplicateRequest) {
            tracing::debug!("{:?} refused redelivered request {}", from, request_id);
            return;
        }
        let origin = self.ctx.handle_for(from);
        match self.server.table(op).erase(request_id, Some(origin)) {
            Ok(entry) => self.complete(entry.id.parent_request_id, op, response),
            Err(e) => tracing::debug!("{}", e),
        }
    }

    fn handle_lock_response(&self, from: &NodeId, request_id: u64, result: DegradedLockResult) {
        let origin = self.ctx.handle_for(from);
        let entry = match self.locks.erase(request_id, Some(origin)) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("{}", e);
                return;
            }
        };
        let app_id = entry.id.parent_request_id;
        let LockLeg {
            request,
            location,
            lost,
        } = entry.payload;
        let op = Op::from(&request);
        let key = request.key().to_string();
        tracing::debug!("Degraded lock for {:?}: {:?}", key, result);

        match result {
            DegradedLockResult::IsLocked { reconstructor }
            | DegradedLockResult::WasLocked { reconstructor } => {
                let Some(kind) = degraded_kind(&request) else {
                    self.complete(app_id, op, Err(EngineError::NodeUnavailable(lost).into()));
                    return;
                };
                let message = |request_id: u64| Message::Degraded {
                    request_id,
                    lost,
                    location,
                    key: key.clone(),
                    op: kind,
                };
                self.forward(app_id, op, &key, &reconstructor, message);
            }
            DegradedLockResult::NotLocked => {
                self.forward(app_id, op, &key, &lost, normal_message(&request))
            }
            DegradedLockResult::Remapped { target } => {
                self.forward(app_id, op, &key, &target, normal_message(&request))
            }
            DegradedLockResult::NotExist => {
                self.complete(app_id, op, Err(EngineError::NodeUnavailable(lost).into()))
            }
        }
    }

    /// Answers the client of app request `app_id`. The app entry is found by
    /// request id alone; the client handle is recovered from it.
    fn complete(&self, app_id: u64, op: Op, response: ClientResponse) {
        let entry = match self.app.table(op).erase(app_id, None) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("{}", e);
                return;
            }
        };
        self.answer(entry.id.origin, response);
    }

    fn answer(&self, client: Handle, response: ClientResponse) {
        match self.clients.lock().remove(client) {
            Some(reply) => {
                if reply.send(response).is_err() {
                    tracing::debug!("Client went away before its answer");
                }
            }
            None => tracing::debug!("Client handle already answered"),
        }
    }

    fn fail_server_legs(&self, op: Op, settled: Vec<Settled<ServerLeg>>, code: ErrorCode) {
        for settled in settled {
            tracing::warn!("Failing {:?} for {:?}: {}", op, settled.entry.payload.key, code);
            self.complete(settled.entry.id.parent_request_id, op, Err(code));
        }
    }

    fn peer_lost(&self, node: &NodeId) {
        let origin = self.ctx.forget(node);
        for (op, table) in self.server.all() {
            self.fail_server_legs(op, table.drain_origin(origin), ErrorCode::NodeUnavailable);
        }
    }

    fn reap(&self, now: Instant) {
        for (op, table) in self.server.all() {
            self.fail_server_legs(op, table.reap_expired(now), ErrorCode::Timeout);
        }
        for settled in self.locks.reap_expired(now) {
            let op = Op::from(&settled.entry.payload.request);
            self.complete(settled.entry.id.parent_request_id, op, Err(ErrorCode::Timeout));
        }
        for (_, table) in self.app.all() {
            for settled in table.reap_expired(now) {
                self.answer(settled.entry.id.origin, Err(ErrorCode::Timeout));
            }
        }
    }
}

impl EventHandler<NodeEvent> for ProxyNode {
    fn handle(&self, event: NodeEvent) {
        match event {
            NodeEvent::Client { request, reply } => self.accept(request, reply),
            NodeEvent::Peer(envelope) | NodeEvent::Resumed(envelope) => self.handle_peer(envelope),
            NodeEvent::Reap => self.reap(Instant::now()),
        }
    }
}

fn normal_message(request: &ClientRequest) -> impl FnOnce(u64) -> Message + use<> {
    let request = request.clone();
    move |request_id| match request {
        ClientRequest::Get { key } => Message::Get { request_id, key },
        ClientRequest::Set { key, value } => Message::Set {
            request_id,
            key,
            value,
        },
        ClientRequest::Update { key, offset, value } => Message::Update {
            request_id,
            key,
            offset,
            value,
        },
        ClientRequest::Delete { key } => Message::Delete { request_id, key },
    }
}

fn degraded_kind(request: &ClientRequest) -> Option<DegradedOpKind> {
    match request {
        ClientRequest::Get { .. } => Some(DegradedOpKind::Get),
        ClientRequest::Update { offset, value, .. } => Some(DegradedOpKind::Update {
            offset: *offset,
            value: value.clone(),
        }),
        ClientRequest::Delete { .. } => Some(DegradedOpKind::Delete),
        ClientRequest::Set { .. } => None,
    }
}
