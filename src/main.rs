//! Wormhole relay
//!
//! Accepts long-lived client connections and gives each client a public TCP
//! endpoint whose traffic is tunneled back over that connection.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wormhole_auth::{AllowAnyKey, KeyAllowlist, PeerAuthorizer};
use wormhole_control::{MemoryRegistry, ServerConfig, TunnelServer};
use wormhole_transport::ServerKey;

/// Reverse tunnel relay
#[derive(Parser, Debug)]
#[command(name = "wormhole-relay")]
#[command(about = "Run a reverse tunnel relay", long_about = None)]
#[command(version = env!("WORMHOLE_VERSION"))]
#[command(long_version = concat!(env!("WORMHOLE_VERSION"), " (", env!("WORMHOLE_COMMIT"), ")\nbuilt ", env!("WORMHOLE_BUILT")))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a private key (PKCS#8 PEM) and print its fingerprint
    GenerateKey {
        /// Write the key here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address client connections are accepted on
    #[arg(long, env = "WORMHOLE_LISTEN", default_value = "0.0.0.0:2222")]
    listen: String,

    /// Node identifier recorded with every session (defaults to the hostname)
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Host name advertised in endpoint addresses
    #[arg(long, env = "LOCALHOST", default_value = "localhost")]
    localhost: String,

    /// Cluster URL recorded with every session
    #[arg(long, env = "CLUSTER_URL", default_value = "")]
    cluster_url: String,

    /// Interface public endpoints are bound on
    #[arg(long, env = "ENDPOINT_BIND_IP", default_value = "0.0.0.0")]
    endpoint_bind_ip: IpAddr,

    /// Server private key file (PKCS#8 PEM)
    #[arg(long, env = "SSH_PRIVATE_KEY_FILE")]
    private_key_file: Option<PathBuf>,

    /// Server private key, inline PEM
    #[arg(long, env = "SSH_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Authorized client keys file; without it every key is accepted
    #[arg(long, env = "AUTHORIZED_KEYS_FILE")]
    authorized_keys: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn generate_key(out: Option<PathBuf>) -> Result<()> {
    let (key, pem) = ServerKey::generate("localhost").context("Failed to generate key")?;

    match out {
        Some(path) => {
            std::fs::write(&path, &pem)
                .with_context(|| format!("Failed to write key to {}", path.display()))?;
            println!("Key written to {}", path.display());
        }
        None => print!("{}", pem),
    }
    eprintln!("Fingerprint: {}", key.fingerprint());

    Ok(())
}

fn load_private_key(args: &ServerArgs) -> Result<Vec<u8>> {
    match (&args.private_key_file, &args.private_key) {
        (Some(path), _) => std::fs::read(path)
            .with_context(|| format!("Failed to read private key {}", path.display())),
        (None, Some(pem)) => Ok(pem.clone().into_bytes()),
        (None, None) => bail!("A server private key is required (--private-key-file or --private-key)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    wormhole_transport::ensure_crypto_provider();

    let cli = Cli::parse();

    if let Some(Commands::GenerateKey { out }) = cli.command {
        return generate_key(out);
    }

    let args = cli.server_args;
    init_logging(&args.log_level)?;

    let node_id = match args.node_id.clone() {
        Some(node_id) => node_id,
        None => hostname::get()
            .context("Failed to read hostname")?
            .to_string_lossy()
            .into_owned(),
    };

    let config = ServerConfig::new(node_id, args.localhost.clone(), load_private_key(&args)?)
        .with_cluster_url(args.cluster_url.clone())
        .with_endpoint_bind_ip(args.endpoint_bind_ip);

    let authorizer: Arc<dyn PeerAuthorizer> = match &args.authorized_keys {
        Some(path) => Arc::new(KeyAllowlist::load(path).context("Failed to load authorized keys")?),
        None => {
            info!("No authorized keys file given, accepting any client key");
            Arc::new(AllowAnyKey)
        }
    };

    info!("Starting wormhole relay {}", env!("WORMHOLE_VERSION"));
    info!("Node: {}", config.node_id);
    info!("Endpoints advertised as {}:<port>", config.localhost);

    let server = Arc::new(
        TunnelServer::new(config, authorizer, Arc::new(MemoryRegistry::new()))
            .context("Failed to initialize relay")?,
    );

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;

    let serve_handle = tokio::spawn(server.clone().serve(listener));

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, closing sessions...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    server.shutdown().await;
    match serve_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Relay stopped with error: {}", e),
        Err(e) => error!("Relay task failed: {}", e),
    }

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
