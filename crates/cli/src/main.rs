use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use mdns_sd::ServiceEvent;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use elio_agent::{Agent, AgentConfig, Backend, CloudBackend};
use elio_config::AppConfig;
use elio_mesh::{
    Capability, Discovery, MeshNode, NodeEvent, NodeIdentity, NodeOptions, resolved_to_peer,
};
use elio_tools::ToolRegistry;

#[derive(Debug, Parser)]
#[command(
    name = "elio",
    version,
    about = "Hybrid on-device / peer-to-peer LLM assistant node"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "elio.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a mesh node: announce over Bonjour, serve forwarded inference,
    /// relay HTTP for offline peers and verify speculative drafts.
    Serve {
        /// Override the configured TCP port.
        #[arg(long)]
        port: Option<u16>,
        /// Connect to peers directly instead of waiting for discovery.
        #[arg(long)]
        peer: Vec<SocketAddr>,
    },
    /// One-shot agent run against the configured backend, streaming tokens
    /// to stdout.
    Chat {
        prompt: String,
        /// Use the Japanese system prompt.
        #[arg(long)]
        japanese: bool,
    },
    /// Print this device's identity; optionally rotate the pairing code.
    Identity {
        #[arg(long)]
        rotate_code: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    init_tracing(&config.telemetry.log_level);

    match cli.command {
        Commands::Serve { port, peer } => serve(config, port, peer).await,
        Commands::Chat { prompt, japanese } => chat(config, prompt, japanese).await,
        Commands::Identity { rotate_code } => identity(config, rotate_code),
    }
}

async fn serve(config: AppConfig, port: Option<u16>, peers: Vec<SocketAddr>) -> Result<()> {
    let data_dir = PathBuf::from(&config.node.data_dir);
    let identity = NodeIdentity::load_or_create(data_dir.join("identity.json"))?;

    let backend: Option<Arc<dyn Backend>> = if config.backend.base_url.is_empty() {
        None
    } else {
        Some(Arc::new(
            CloudBackend::new(&config.backend.base_url, &config.backend.model)
                .with_api_key(&config.backend.api_key),
        ))
    };

    let options = NodeOptions {
        display_name: config.node.display_name.clone(),
        max_hops: config.mesh.max_hops,
        request_timeout: Duration::from_secs(config.mesh.request_timeout_secs),
        peer_stale_after: Duration::from_secs(config.mesh.peer_stale_secs),
        protocol_version: config.mesh.protocol_version,
        relay_allowed_hosts: config.relay.allowed_hosts.clone(),
        relay_rate_limit_per_minute: config.relay.rate_limit_per_minute,
    };
    let has_backend = backend.is_some();
    let node = Arc::new(MeshNode::new(identity.clone(), options, backend, &data_dir)?);
    node.set_capability(Capability {
        has_local_llm: has_backend,
        model_name: has_backend.then(|| config.backend.model.clone()),
        is_charging: true,
        ..Capability::default()
    });

    let port = port.unwrap_or(config.mesh.port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let discovery = Discovery::announce(
        &identity.device_id,
        port,
        &identity.pairing_code,
        config.mesh.protocol_version,
    )?;
    info!(
        device_id = %identity.device_id,
        code = %identity.pairing_code,
        port,
        "serving"
    );

    // Browse for peers and dial whatever resolves.
    let browse_rx = discovery.browse()?;
    let browse_node = node.clone();
    let my_instance = identity.device_id.clone();
    tokio::spawn(async move {
        while let Ok(event) = browse_rx.recv_async().await {
            let ServiceEvent::ServiceResolved(info) = event else {
                continue;
            };
            let peer = resolved_to_peer(&info);
            if peer.instance_name.contains(&my_instance) {
                continue;
            }
            for ip in &peer.addresses {
                let addr = SocketAddr::new(*ip, peer.port);
                match browse_node.connect(addr).await {
                    Ok(()) => {
                        info!(%addr, "connecting to discovered peer");
                        break;
                    }
                    Err(err) => warn!(%addr, error = %err, "dial failed"),
                }
            }
        }
    });

    for addr in peers {
        node.connect(addr).await?;
    }

    let mut events = node.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NodeEvent::PeerConnected {
                    device_id,
                    display_name,
                } => info!(%device_id, %display_name, "peer connected"),
                NodeEvent::PeerDisconnected { device_id } => {
                    info!(%device_id, "peer disconnected");
                }
                NodeEvent::DirectMessage(dm) => {
                    info!(from = %dm.from_id, content = %dm.content, "direct message");
                }
                NodeEvent::FriendRequestReceived(req) => {
                    info!(from = %req.from_id, name = %req.display_name, "friend request");
                }
                NodeEvent::FriendAccepted(acc) => {
                    info!(from = %acc.from_id, "friend request accepted");
                }
            }
        }
    });

    let server_node = node.clone();
    let serve_task = tokio::spawn(async move { server_node.serve(listener).await });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.shutdown();
    let _ = serve_task.await;
    discovery.shutdown();
    Ok(())
}

async fn chat(config: AppConfig, prompt: String, japanese: bool) -> Result<()> {
    let backend: Arc<dyn Backend> = Arc::new(
        CloudBackend::new(&config.backend.base_url, &config.backend.model)
            .with_api_key(&config.backend.api_key),
    );
    let agent_config = AgentConfig {
        max_iterations: config.agent.max_iterations,
        max_tool_result_len: config.agent.max_tool_result_len,
        use_japanese: japanese || config.agent.use_japanese,
        on_token: Some(Box::new(|token| {
            print!("{token}");
            let _ = std::io::stdout().flush();
        })),
        ..AgentConfig::default()
    };

    let mut registry = ToolRegistry::new();
    if let Err(err) = elio_tools::register_builtins(&mut registry, std::env::current_dir()?) {
        bail!("tool registration failed: {err}");
    }

    let mut agent = Agent::new(backend, Arc::new(registry), agent_config);
    let result = agent.run(&prompt).await;
    println!();

    if let Some(error) = result.error {
        bail!("run failed: {error}");
    }
    info!(
        iterations = result.iterations,
        tool_calls = result.tool_calls.len(),
        "run complete"
    );
    Ok(())
}

fn identity(config: AppConfig, rotate_code: bool) -> Result<()> {
    let path = PathBuf::from(&config.node.data_dir).join("identity.json");
    let mut identity = NodeIdentity::load_or_create(&path)?;
    if rotate_code {
        // A running `serve` picks the new code up on restart; in-process
        // rotation goes through Discovery::rotate_pairing_code.
        let code = identity.rotate_pairing_code(&path)?;
        println!("pairing code rotated: {code}");
    }
    println!("device id:    {}", identity.device_id);
    println!("pairing code: {}", identity.pairing_code);
    Ok(())
}
