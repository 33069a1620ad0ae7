//! CLI entry point. Grounded on the teacher's `qres_daemon::main`: a
//! `clap::Parser` wrapping a small set of subcommands, `tracing_subscriber`
//! JSON init, the daemon lifecycle delegated to `DaemonManager`. Narrowed to
//! the operations this federation needs (`run`/`start`/`stop`/`status`/
//! `keygen`) — no compression subcommands, no swarm-mode flags, those were
//! artifacts of the teacher's own ML CLI surface.

use clap::{Parser, Subcommand};
use pulsemesh_core::consent::AlwaysGrantConsent;
use pulsemesh_core::ids::NodeId;
use pulsemesh_core::vector::{EmotionalScalars, EmotionalVector};
use pulsemesh_core::wire::WireCodec;
use pulsemesh_node::config::{pulsemesh_data_dir, Config};
use pulsemesh_node::daemon::DaemonManager;
use pulsemesh_node::dreaming::DreamScheduler;
use pulsemesh_node::federation::{EchoGenerator, FederationConfig, FederationNode};
use pulsemesh_node::persistence::PersistenceLayer;
use pulsemesh_node::proximity::{ProximityLayer, UdpProximityBackend};
use pulsemesh_node::security::{NodeSigner, ReputationHandle, ReputationManager};
use pulsemesh_node::telemetry::{Telemetry, TracingTelemetry};
use pulsemesh_node::transport::TransportLayer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pulsemesh-node", version, about = "PulseMesh federation node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node in the foreground (transport, proximity, persistence,
    /// coordinator, API server).
    Run,
    /// Start the node as a background daemon.
    Start,
    /// Stop a running background daemon.
    Stop,
    /// Report whether a background daemon is running.
    Status,
    /// Generate (or display) this node's signing keypair.
    Keygen,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().json().with_max_level(tracing::Level::INFO).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_node())
        }
        Commands::Start => DaemonManager::start(),
        Commands::Stop => DaemonManager::stop(),
        Commands::Status => {
            DaemonManager::status();
            Ok(())
        }
        Commands::Keygen => keygen(),
    }
}

fn keygen() -> anyhow::Result<()> {
    let config = Config::load()?;
    let key_path = config
        .security
        .key_path
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| pulsemesh_data_dir().join("signing.key"));
    let signer = NodeSigner::new(&key_path)?;
    info!(path = %key_path.display(), pubkey = %signer.public_key_hex(), "signing key ready");
    Ok(())
}

async fn run_node() -> anyhow::Result<()> {
    let config = Config::load()?;
    let local_node_id = NodeId::generate();
    let local_node_name = config
        .proximity
        .device_name
        .clone()
        .unwrap_or_else(|| format!("node-{}", &local_node_id.as_str()[..8]));

    info!(node_id = %local_node_id, name = %local_node_name, "starting pulsemesh node");

    let key_path = config
        .security
        .key_path
        .clone()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| pulsemesh_data_dir().join("signing.key"));
    let signer: Arc<dyn pulsemesh_core::signer::Signer> = Arc::new(NodeSigner::new(&key_path)?);
    let consent: Arc<dyn pulsemesh_core::consent::Consent> = Arc::new(AlwaysGrantConsent);
    let telemetry: Arc<dyn Telemetry> = Arc::new(TracingTelemetry::new());

    let reputation_path = config
        .security
        .reputation_path
        .clone()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| pulsemesh_data_dir().join("reputation.json"));
    let reputation = ReputationHandle::new(ReputationManager::new(reputation_path));

    let codec = Arc::new(match &config.transport.encryption_key {
        Some(key) => WireCodec::with_obfuscation_key(key.clone().into_bytes()),
        None => WireCodec::new(),
    });

    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let (transport, ingress) = TransportLayer::start(
        local_node_id.clone(),
        local_node_name.clone(),
        keypair,
        codec,
        Some(signer.clone()),
        Some(consent.clone()),
        telemetry.clone(),
        Some(reputation.clone()),
    )
    .await?;

    let persistence = PersistenceLayer::start(
        config.persistence.base_path.clone(),
        local_node_id.clone(),
        local_node_name.clone(),
        Some(signer.clone()),
        Some(consent.clone()),
    );

    let proximity_backend = Arc::new(
        UdpProximityBackend::bind(4242, "255.255.255.255:4242".parse()?).await?,
    );
    let proximity = Arc::new(ProximityLayer::new(
        proximity_backend,
        local_node_id.clone(),
        local_node_name.clone(),
    ));

    let federation_config = FederationConfig {
        local_node_id: local_node_id.clone(),
        local_node_name: local_node_name.clone(),
        broadcast_interval: Duration::from_secs_f64(config.coordinator.broadcast_interval_secs),
        advertise_interval: Duration::from_secs_f64(config.proximity.advertise_interval_secs),
        scan_interval: Duration::from_secs_f64(config.proximity.scan_interval_secs),
        default_min_participants: config.coordinator.default_min_participants,
        default_timeout: Duration::from_secs_f64(config.coordinator.default_timeout_secs),
        default_method: config.coordinator.default_method,
    };

    let local_emotion = EmotionalVector::from_scalars(EmotionalScalars::neutral());
    let generator = EchoGenerator { model_id: "echo".into() };

    let federation = FederationNode::start(
        federation_config,
        transport,
        ingress,
        persistence.clone(),
        proximity,
        generator,
        local_emotion,
        telemetry.clone(),
        Some(reputation.clone()),
    );

    if config.api.enabled {
        let api_federation = federation.clone();
        let api_port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = pulsemesh_node::api::run_api_server(api_port, Some(api_federation)).await {
                error!(error = %e, "api server exited");
            }
        });
    }

    let pid_file = DaemonManager::pid_file();
    let _ = std::fs::write(&pid_file, std::process::id().to_string());

    let dream_federation = federation.clone();
    tokio::spawn(async move {
        let mut scheduler = DreamScheduler::new(Duration::from_secs(600));
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            if scheduler.should_dream() {
                match dream_federation
                    .store_dream("a quiet idle reflection".to_string(), vec!["idle".into()])
                    .await
                {
                    Ok(record) => {
                        info!(record_id = %record.record_id, count = scheduler.dream_count() + 1, "stored idle dream");
                        scheduler.mark_dreamed();
                    }
                    Err(e) => error!(error = %e, "failed to store idle dream"),
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    federation.shutdown().await;
    let _ = std::fs::remove_file(&pid_file);
    Ok(())
}
