// ThemisDB shard server - serves the shard data/query API and routes
// operations across the cluster.

use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use themis_sharding::{
    config::Config,
    security::hsm::HsmProvider,
    server::{create_shard_router, MemoryExecutor, ShardServerState},
    sharding::{
        hash_ring::ConsistentHashRing,
        remote_executor::{RemoteExecutor, RemoteExecutorConfig, UnconfiguredRemote},
        resolver::UrnResolver,
        router::ShardRouter,
        signed_request::{CertificateRegistry, SignedRequestSigner, SignedRequestVerifier},
        topology::{FileTopologyStore, ShardTopology},
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Topology, refreshed from the file store when one is configured.
    let topology = if config.shard.topology_path.is_empty() {
        Arc::new(ShardTopology::new())
    } else {
        let topology = Arc::new(ShardTopology::with_store(Box::new(FileTopologyStore::new(
            &config.shard.topology_path,
        ))));
        if let Err(err) = topology.refresh().await {
            warn!(
                "Could not load topology from {}: {}",
                config.shard.topology_path, err
            );
        }
        topology
    };

    // Ring follows the topology: one entry per known shard.
    let hash_ring = Arc::new(ConsistentHashRing::new());
    for shard in topology.get_all_shards() {
        hash_ring.add_shard(&shard.shard_id, config.shard.virtual_nodes);
    }

    let resolver = Arc::new(UrnResolver::new(
        topology.clone(),
        hash_ring.clone(),
        config.shard.local_shard_id.clone(),
    ));

    // HSM signing core. Falls back to deterministic mode when no module
    // is configured; the status endpoint reports which mode is active.
    let mut hsm = HsmProvider::new(config.hsm.clone());
    hsm.initialize();
    let hsm = Arc::new(hsm);
    info!("{}", hsm.token_info());

    let signer = Arc::new(SignedRequestSigner::new(
        config.shard.local_shard_id.clone(),
        hsm.clone(),
    ));

    let registry = Arc::new(CertificateRegistry::new());
    for path in &config.peer_cert_paths {
        match std::fs::read(path) {
            Ok(pem) => match registry.load_pem(&pem) {
                Ok(info) => info!(
                    "Registered peer certificate {} for shard {}",
                    info.serial_number, info.shard_id
                ),
                Err(err) => warn!("Skipping peer certificate {}: {}", path, err),
            },
            Err(err) => warn!("Cannot read peer certificate {}: {}", path, err),
        }
    }
    let verifier = Arc::new(SignedRequestVerifier::new(
        config.verifier_config(),
        registry,
    ));

    let executor: Arc<dyn themis_sharding::sharding::RemoteDispatch> =
        match RemoteExecutor::new(
            RemoteExecutorConfig {
                local_shard_id: config.shard.local_shard_id.clone(),
                enable_signing: config.enable_signing,
                mtls: config.mtls.clone(),
            },
            Some(signer),
        ) {
            Ok(executor) => Arc::new(executor),
            Err(err) => {
                warn!("Remote execution disabled: {}", err);
                Arc::new(UnconfiguredRemote)
            }
        };

    let router = Arc::new(ShardRouter::new(
        resolver,
        executor,
        Some(Arc::new(MemoryExecutor::new())),
        config.router_config(),
    ));

    let state = ShardServerState {
        router,
        verifier: Some(verifier),
        hsm,
    };

    let app = create_shard_router(state).layer(CorsLayer::permissive());

    let addr = config.server_address();
    info!(
        "Shard {} listening on {}",
        if config.shard.local_shard_id.is_empty() {
            "(client-only)"
        } else {
            &config.shard.local_shard_id
        },
        addr
    );

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
