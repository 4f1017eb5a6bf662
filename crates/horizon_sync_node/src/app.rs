//! Application runtime: serve mode and push mode.

use crate::cli::CliArgs;
use crate::config::AppConfig;
use crate::signals::wait_for_shutdown_signal;
use anyhow::{Context, Result};
use horizon_entity_sync::{
    acknowledge, Components, EntityStore, EntitySyncClient, EntitySyncServer, InMemoryEntityStore,
    LocalEntityId, SyncNotice,
};
use horizon_rpc::{Caller, ConnectionContext, Dispatcher, HandlerError, Message, Params};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// What the node does once configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Host a dispatcher with the entity sync handlers installed.
    Serve,
    /// Mirror a demo world to the node at `peer`, then exit.
    Push { peer: String },
}

/// Main application that owns configuration and drives one of the modes.
pub struct Application {
    config: AppConfig,
    mode: Mode,
}

impl Application {
    /// Loads configuration, applies command-line overrides and sets up
    /// logging.
    pub async fn new(args: CliArgs) -> Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(bind) = args.bind_address {
            config.node.bind_address = bind;
        }
        if let Some(level) = args.log_level {
            config.logging.level = level;
        }

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

        crate::logging::setup_logging(&config.logging, args.json_logs)?;

        let mode = match args.connect {
            Some(peer) => Mode::Push { peer },
            None => Mode::Serve,
        };

        display_banner();
        info!("🚀 Horizon Sync Node v{}", env!("CARGO_PKG_VERSION"));
        info!("📂 Config file: {}", args.config_path.display());
        info!("🎯 Mode: {:?}", mode);

        Ok(Self { config, mode })
    }

    pub async fn run(self) -> Result<()> {
        match self.mode.clone() {
            Mode::Serve => self.serve().await,
            Mode::Push { peer } => self.push(&peer).await,
        }
    }

    async fn serve(&self) -> Result<()> {
        let dispatcher = Arc::new(Dispatcher::new(self.config.rpc.clone()));
        register_node_handlers(&dispatcher);

        let store = Arc::new(InMemoryEntityStore::new());
        let sync = EntitySyncServer::new(store.clone(), self.config.sync.clone());
        sync.set_observer(log_notice);
        sync.install(&dispatcher);

        let listener = dispatcher.listen(self.config.bind_address()?).await?;
        info!("🌐 Accepting sync peers on {}", listener.local_addr());

        let monitor = {
            let dispatcher = dispatcher.clone();
            let sync = sync.clone();
            let store = store.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STATS_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let stats = dispatcher.stats();
                    info!(
                        "📊 {} connection(s), {} request(s) handled, {} sync session(s), {} mirrored entit(ies)",
                        stats.active_connections,
                        stats.requests_handled,
                        sync.session_count(),
                        store.len()
                    );
                }
            })
        };

        wait_for_shutdown_signal().await?;
        info!("🛑 Shutting down sync node...");

        monitor.abort();
        dispatcher.shutdown();
        listener.stop();

        let stats = dispatcher.stats();
        info!(
            "✅ Node stopped: {} request(s) handled, {} unknown method(s), {} handler error(s)",
            stats.requests_handled, stats.method_not_found, stats.handler_errors
        );
        Ok(())
    }

    async fn push(&self, peer: &str) -> Result<()> {
        let caller = Arc::new(
            Caller::connect(peer, self.config.rpc.clone())
                .await
                .with_context(|| format!("failed to reach {peer}"))?,
        );
        info!("🔗 Connected to {}", caller.remote_addr());

        let pong = caller.call("ping", Params::new())?.await?;
        if pong.is_error() {
            warn!("Peer does not answer ping: {:?}", pong.error_reason());
        }

        let world = InMemoryEntityStore::new();
        let client = EntitySyncClient::new(caller.clone());
        let result = mirror_demo_world(&world, &client, self.config.node.demo_entities).await;

        caller.close().await;
        let stats = caller.stats();
        info!(
            "📊 {} call(s) issued, {} matched, {} timed out",
            stats.calls_issued, stats.responses_matched, stats.timeouts
        );
        result
    }
}

/// Creates `count` entities locally and walks each one through the whole
/// lifecycle on the peer.
async fn mirror_demo_world(
    world: &InMemoryEntityStore,
    client: &EntitySyncClient,
    count: u64,
) -> Result<()> {
    let mut created = Vec::new();
    for index in 0..count {
        let local = world.create_entity()?;
        world.apply_components(local, &demo_components(index))?;
        created.push((local, client.sync_entity_creation(local)?));
    }

    for (local, call) in created {
        let ack = acknowledge(call).await?;
        info!("➕ {} mirrored as {:?}", local, ack.local_entity);
    }

    for local in world.entity_ids() {
        if let Some(record) = world.get_entity(local) {
            let ack = acknowledge(client.sync_entity_update(local, record.components)?).await?;
            debug!("✏️ Update of {} applied: {}", local, ack.applied);
        }
        let health = json!(100 - (local.0 % 100));
        let mut update = Components::new();
        update.insert("health".to_string(), health.clone());
        world.apply_components(local, &update)?;
        acknowledge(client.sync_component(local, "health", health)?).await?;
    }

    // Retire every other entity; the rest stays mirrored until we disconnect.
    let retired: Vec<LocalEntityId> = world.entity_ids().into_iter().step_by(2).collect();
    for local in retired {
        let call = client.sync_entity_removal(local)?;
        world.remove_entity(local)?;
        let ack = acknowledge(call).await?;
        info!("➖ {} retired (applied: {})", local, ack.applied);
    }

    info!(
        "✅ Demo world pushed: {} entit(ies) still synchronized",
        client.table().len()
    );
    Ok(())
}

fn demo_components(index: u64) -> Components {
    let mut components = Components::new();
    components.insert("name".to_string(), json!(format!("crate-{index}")));
    components.insert(
        "position".to_string(),
        json!({ "x": index as f64 * 1.5, "y": 0.0, "z": -(index as f64) }),
    );
    components
}

fn register_node_handlers(dispatcher: &Dispatcher) {
    dispatcher.register_handler("ping", |request: &Message, _ctx: &ConnectionContext| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Ok(request.reply(horizon_rpc::to_params(json!({ "pong": true, "timestamp": now }))))
    });

    dispatcher.register_handler("echo", |request: &Message, _ctx: &ConnectionContext| {
        if request.params().is_empty() {
            return Err(HandlerError::InvalidParams("echo needs at least one param".to_string()));
        }
        Ok(request.reply(request.params().clone()))
    });

    dispatcher.on_disconnect(|ctx: &ConnectionContext| {
        info!("👋 Peer {} ({}) disconnected", ctx.connection_id, ctx.remote_addr);
    });
}

fn log_notice(notice: &SyncNotice) {
    match notice.local_entity {
        Some(local) => info!(
            "🔄 {} {} -> {} from {}",
            notice.event.method(),
            notice.event.network_id(),
            local,
            notice.connection
        ),
        None => debug!(
            "🔄 {} {} from {} did not resolve",
            notice.event.method(),
            notice.event.network_id(),
            notice.connection
        ),
    }
}

fn display_banner() {
    println!("\n╔══════════════════════════════════════╗");
    println!("║          HORIZON SYNC NODE           ║");
    println!("║   RPC dispatch + entity mirroring    ║");
    println!("╚══════════════════════════════════════╝\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_rpc::{memory, RpcConfig};

    #[tokio::test]
    async fn test_demo_world_mirrors_onto_sync_server() {
        let dispatcher = Arc::new(Dispatcher::new(RpcConfig::default()));
        register_node_handlers(&dispatcher);
        let mirror = Arc::new(InMemoryEntityStore::new());
        let sync = EntitySyncServer::new(mirror.clone(), Default::default());
        sync.install(&dispatcher);

        let (client_side, server_side) = memory::pair();
        dispatcher.serve_connection(Box::new(server_side));
        let caller = Arc::new(Caller::with_connection(
            Box::new(client_side),
            RpcConfig::default(),
        ));
        let client = EntitySyncClient::new(caller.clone());

        let world = InMemoryEntityStore::new();
        mirror_demo_world(&world, &client, 4).await.unwrap();

        // Two of the four entities were retired on both sides.
        assert_eq!(world.len(), 2);
        assert_eq!(mirror.len(), 2);
        assert_eq!(client.table().len(), 2);

        for local in world.entity_ids() {
            let network = client.network_id(local).unwrap();
            let table = sync.table(sync.connections()[0]).unwrap();
            let mirrored = table.local_for(network).unwrap();
            assert_eq!(
                mirror.component(mirrored, "health"),
                world.component(local, "health")
            );
            assert_eq!(
                mirror.component(mirrored, "name"),
                world.component(local, "name")
            );
        }

        caller.close().await;
    }

    #[test]
    fn test_echo_requires_params() {
        let dispatcher = Dispatcher::new(RpcConfig::default());
        register_node_handlers(&dispatcher);
        let ctx = ConnectionContext::detached();

        let empty = Message::request("echo", Params::new(), "1");
        assert!(dispatcher.dispatch(&empty, &ctx).is_error());

        let full = Message::request("echo", horizon_rpc::to_params(json!({"a": 1})), "2");
        let reply = dispatcher.dispatch(&full, &ctx);
        assert!(!reply.is_error());
        assert_eq!(reply.param("a"), Some(&json!(1)));
    }
}
