use axum::{
    Router,
    extract::Extension,
    routing::{delete, get, post},
};
use ec_cluster::cluster::types::{Node, NodeId, NodeRole};
use ec_cluster::cluster::{ClusterView, StripeList};
use ec_cluster::config::EngineConfig;
use ec_cluster::event::{EventQueue, WorkerPool};
use ec_cluster::node::handlers::{
    handle_admin_fail, handle_admin_recover, handle_delete, handle_get, handle_put,
    handle_update,
};
use ec_cluster::node::protocol::{
    ENDPOINT_ADMIN_FAIL, ENDPOINT_ADMIN_RECOVER, ENDPOINT_DELETE, ENDPOINT_GET,
    ENDPOINT_MESSAGE, ENDPOINT_PUT, ENDPOINT_UPDATE,
};
use ec_cluster::node::types::NodeEvent;
use ec_cluster::node::{CoordinatorNode, NodeContext, ProxyNode, ServerNode};
use ec_cluster::persistence::MemoryStorage;
use ec_cluster::transport::HttpTransport;
use ec_cluster::transport::handlers::handle_internal_message;
use std::net::SocketAddr;
use std::sync::Arc;

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} --id <id> --bind <addr:port> --node <id>=<role>@<addr:port> ...",
        program
    );
    eprintln!("Roles: proxy, server, coordinator");
    eprintln!(
        "Example: {} --id s0 --bind 127.0.0.1:7100 --node c=coordinator@127.0.0.1:7000 \
         --node p=proxy@127.0.0.1:7001 --node s0=server@127.0.0.1:7100 ...",
        program
    );
    std::process::exit(1);
}

/// Parses `id=role@addr`.
fn parse_node(entry: &str) -> anyhow::Result<Node> {
    let (id, rest) = entry
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected id=role@addr, got {:?}", entry))?;
    let (role, addr) = rest
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("expected id=role@addr, got {:?}", entry))?;
    let role = match role {
        "proxy" => NodeRole::Proxy,
        "server" => NodeRole::Server,
        "coordinator" => NodeRole::Coordinator,
        other => anyhow::bail!("unknown role {:?}", other),
    };
    Ok(Node::new(NodeId::from(id), role, addr.parse()?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = std::env::var("EC_LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        usage(&args[0]);
    }

    let mut id: Option<NodeId> = None;
    let mut bind_addr: Option<SocketAddr> = None;
    let mut members: Vec<Node> = vec![];

    let mut i = 1;
    while i < args.len() {
        let Some(value) = args.get(i + 1) else {
            usage(&args[0]);
        };
        match args[i].as_str() {
            "--id" => id = Some(NodeId::from(value.as_str())),
            "--bind" => bind_addr = Some(value.parse()?),
            "--node" => members.push(parse_node(value)?),
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    let id = id.ok_or_else(|| anyhow::anyhow!("--id is required"))?;
    let bind_addr = bind_addr.ok_or_else(|| anyhow::anyhow!("--bind is required"))?;
    let role = members
        .iter()
        .find(|node| node.id == id)
        .map(|node| node.role)
        .ok_or_else(|| anyhow::anyhow!("{:?} is not among the --node entries", id))?;
    let coordinator = members
        .iter()
        .find(|node| node.role == NodeRole::Coordinator)
        .map(|node| node.id.clone())
        .ok_or_else(|| anyhow::anyhow!("no coordinator among the --node entries"))?;

    let config = EngineConfig::from_env();
    config.validate()?;
    let config = Arc::new(config);
    tracing::info!(
        "Starting {:?} as {:?} on {} (k={}, m={})",
        id,
        role,
        bind_addr,
        config.data_chunks,
        config.parity_chunks
    );

    // 1. Cluster view and placement:
    let servers: Vec<NodeId> = members
        .iter()
        .filter(|node| node.role == NodeRole::Server)
        .map(|node| node.id.clone())
        .collect();
    let placement = Arc::new(StripeList::new(
        servers,
        config.list_count,
        config.data_chunks,
        config.parity_chunks,
    )?);
    let view = Arc::new(ClusterView::from_nodes(members));

    // 2. Event queue and transport:
    let queue = Arc::new(EventQueue::<NodeEvent>::from_config(&config));
    let transport = Arc::new(HttpTransport::new(view.clone(), id.clone(), queue.clone()));
    let ctx = NodeContext::new(
        id.clone(),
        coordinator,
        config.clone(),
        view,
        placement,
        transport,
        queue.clone(),
    );

    // 3. Role and HTTP router:
    let app = Router::new().route(ENDPOINT_MESSAGE, post(handle_internal_message));
    let mut server_node: Option<Arc<ServerNode>> = None;
    let (app, pool) = match role {
        NodeRole::Proxy => {
            let proxy = Arc::new(ProxyNode::new(ctx));
            let pool = WorkerPool::start(queue.clone(), proxy.clone(), config.worker_count);
            let app = app
                .route(ENDPOINT_PUT, post(handle_put))
                .route(&format!("{}/:key", ENDPOINT_GET), get(handle_get))
                .route(ENDPOINT_UPDATE, post(handle_update))
                .route(&format!("{}/:key", ENDPOINT_DELETE), delete(handle_delete))
                .layer(Extension(proxy));
            (app, pool)
        }
        NodeRole::Server => {
            let server = Arc::new(ServerNode::new(ctx, Arc::new(MemoryStorage::new()))?);
            let pool = WorkerPool::start(queue.clone(), server.clone(), config.worker_count);

            // Heartbeats to the coordinator:
            let heartbeat = server.clone();
            let interval = config.heartbeat_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    heartbeat.heartbeat();
                }
            });

            server_node = Some(server);
            (app, pool)
        }
        NodeRole::Coordinator => {
            let coordinator = Arc::new(CoordinatorNode::new(ctx));
            let pool = WorkerPool::start(queue.clone(), coordinator.clone(), config.worker_count);
            let app = app
                .route(&format!("{}/:id", ENDPOINT_ADMIN_FAIL), post(handle_admin_fail))
                .route(
                    &format!("{}/:id", ENDPOINT_ADMIN_RECOVER),
                    post(handle_admin_recover),
                )
                .layer(Extension(coordinator));
            (app, pool)
        }
    };
    let app = app.layer(Extension(queue.clone()));

    // 4. Spawn reaper:
    let reaper = queue.clone();
    let reap_interval = config.reap_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reap_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = reaper.prioritized_insert(NodeEvent::Reap) {
                tracing::warn!("Failed to schedule reap: {}", e);
            }
        }
    });

    // 5. Start HTTP server:
    tracing::info!("HTTP server listening on {}", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    // 6. Flush open chunks and stop workers:
    if let Some(server) = server_node {
        match server.seal_open_chunks() {
            Ok(sealed) => tracing::info!("Sealed {} open chunks before exit", sealed),
            Err(e) => tracing::error!("Failed to seal open chunks: {}", e),
        }
    }
    pool.shutdown().await;

    Ok(())
}
