//! Corelink broker daemon.
//!
//! A thin driver around the device-session core: binds the TCP
//! listener, runs the handshake on every accepted connection and spawns
//! one session task per device, wired to the in-memory collaborator
//! implementations.
//!
//! # Commands
//!
//! - `serve` - Accept device connections and run sessions
//! - `keygen` - Generate a server keypair

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use corelink::{
    config::CoreConfig,
    crypto::{CryptoManager, DeviceId, InMemoryKeyRepository, KeyPair, KeyRepository, PublicKey},
    events::{InMemoryDeviceAttributes, InMemoryEventPublisher, NoRouting},
    handshake,
    session::{DeviceSession, SessionDeps},
    VERSION,
};

#[derive(Parser)]
#[command(name = "corelinkd")]
#[command(version = VERSION)]
#[command(about = "Corelink - IoT cloud device-session broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept device connections and run sessions
    Serve {
        /// TOML config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Server secret key, 64 hex chars (ephemeral if omitted)
        #[arg(long)]
        server_key: Option<String>,

        /// Pre-registered device keys as <device_id_hex>:<pubkey_hex>
        #[arg(long = "device-key")]
        device_keys: Vec<String>,
    },

    /// Generate a server keypair and print it as hex
    Keygen,
}

#[tokio::main]
async fn main() -> corelink::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corelink=info,corelinkd=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            server_key,
            device_keys,
        } => serve(config, server_key, device_keys).await,
        Commands::Keygen => {
            let keys = KeyPair::generate();
            println!("secret: {}", hex::encode(keys.secret_bytes()));
            println!("public: {}", hex::encode(keys.public().as_bytes()));
            Ok(())
        }
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    server_key: Option<String>,
    device_keys: Vec<String>,
) -> corelink::Result<()> {
    let config = match config_path {
        Some(path) => CoreConfig::from_file(path)?.merge(CoreConfig::from_env()),
        None => CoreConfig::from_env(),
    };

    let server_keys = match server_key {
        Some(hex_secret) => {
            let bytes = hex::decode(hex_secret.trim())
                .map_err(|e| corelink::CoreError::Config(format!("bad server key: {e}")))?;
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| corelink::CoreError::Config("server key must be 32 bytes".into()))?;
            KeyPair::from_secret_bytes(secret)
        }
        None => {
            tracing::warn!("no --server-key given, using an ephemeral keypair");
            KeyPair::generate()
        }
    };

    let repository = Arc::new(InMemoryKeyRepository::new());
    for entry in &device_keys {
        let (id_hex, key_hex) = entry.split_once(':').ok_or_else(|| {
            corelink::CoreError::Config(format!("bad --device-key {entry:?}, want id:pubkey"))
        })?;
        let device_id = DeviceId::from_hex(id_hex)?;
        let key = PublicKey::from_slice(&hex::decode(key_hex)?)?;
        repository.save_device_public_key(&device_id, key);
        tracing::info!(device_id = %device_id, "registered device key");
    }
    let deps = SessionDeps {
        crypto: Arc::new(CryptoManager::new(server_keys, repository)),
        publisher: Arc::new(InMemoryEventPublisher::new()),
        routing: Arc::new(NoRouting),
        attributes: Arc::new(InMemoryDeviceAttributes::new()),
        config: config.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr()).await?;
    tracing::info!(
        addr = %config.server.listen_addr(),
        server_id = %config.server.server_id,
        "corelink listening"
    );

    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true).ok();
        let deps = deps.clone();

        tokio::spawn(async move {
            tracing::debug!(%peer, "connection accepted");
            let (read_half, write_half) = socket.into_split();

            let outcome = match handshake::accept(
                &deps.crypto,
                Box::new(read_half),
                Box::new(write_half),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(%peer, "handshake failed: {err}");
                    return;
                }
            };

            match DeviceSession::start(outcome, deps).await {
                Ok(session) => {
                    let mut events = session.events();
                    while let Ok(event) = events.recv().await {
                        if let corelink::SessionEvent::Disconnect(reason) = event {
                            tracing::debug!(%peer, reason, "session ended");
                            break;
                        }
                    }
                }
                Err(err) => tracing::warn!(%peer, "session start failed: {err}"),
            }
        });
    }
}
