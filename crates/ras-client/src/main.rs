//! RAS phone agent CLI: pairing, connection diagnostics, and a reconnecting
//! session loop against a real daemon.

#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use ras_client::{
    ClientConfig, ConnectMode, ConnectPurpose, ConnectionContext, Connected, CredentialRepository,
    Credentials, FileCredentialRepository, InMemoryCredentialRepository, MemoryIntentStore,
    Orchestrator,
    OrchestratorReconnectService, PairExchangeResult, PairingExchanger, PairingRequest,
    ProgressSink, ReconnectController, ReconnectEvent, ReconnectHandle, ReconnectOutcome,
};
use ras_client::signaling::NtfyRelay;
use ras_crypto::MasterSecret;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ras-client")]
#[command(about = "RAS phone agent connectivity tools")]
struct Args {
    /// Relay base URL (overrides RAS_RELAY_URL)
    #[arg(long, env = "RAS_RELAY_URL")]
    relay: Option<String>,

    /// Where `pair` saves credentials and `connect` reads them
    #[arg(long, env = "RAS_CREDENTIALS_FILE", default_value = "ras-credentials.json")]
    credentials: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a fresh master secret
    Keygen,

    /// Print the relay topic derived from a master secret
    Topic {
        /// Hex-encoded 32-byte master secret
        #[arg(long, env = "RAS_MASTER_SECRET")]
        secret: String,
    },

    /// Pair with a daemon that is displaying a pairing code
    Pair {
        #[arg(long, env = "RAS_MASTER_SECRET")]
        secret: String,
        /// Session id from the pairing code
        #[arg(long)]
        session: String,
        /// Name shown on the daemon
        #[arg(long)]
        name: Option<String>,
    },

    /// Connect to a paired daemon and keep the session alive
    Connect {
        /// Overrides the stored secret; requires --device-id
        #[arg(long, env = "RAS_MASTER_SECRET", requires = "device_id")]
        secret: Option<String>,
        #[arg(long, env = "RAS_DEVICE_ID", requires = "secret")]
        device_id: Option<String>,
        /// Daemon host for the direct capability probe and LAN transport
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Daemon overlay address
        #[arg(long)]
        overlay: Option<IpAddr>,
        /// sequential or race
        #[arg(long)]
        mode: Option<ConnectMode>,
        /// Use the reconnect endpoint for the first attempt
        #[arg(long, default_value_t = false)]
        reconnect: bool,
        /// Exit after the first successful connection
        #[arg(long, default_value_t = false)]
        once: bool,
    },
}

fn load_secret(hex: &str) -> Result<MasterSecret> {
    MasterSecret::from_hex(hex).map_err(|e| anyhow!("invalid master secret: {}", e))
}

fn relay(config: &ClientConfig) -> Result<Arc<NtfyRelay>> {
    let relay = NtfyRelay::new(&config.relay_url, config.relay_settings())
        .with_context(|| format!("invalid relay url {}", config.relay_url))?;
    Ok(Arc::new(relay))
}

fn main() -> Result<()> {
    ras_common::init_tracing();

    let args = Args::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = args.relay {
        config.relay_url = url;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match args.command {
        Command::Keygen => {
            let secret = MasterSecret::generate();
            println!("{}", hex::encode(secret.as_bytes()));
            println!("topic: {}", secret.topic());
        }
        Command::Topic { secret } => {
            println!("{}", load_secret(&secret)?.topic());
        }
        Command::Pair {
            secret,
            session,
            name,
        } => {
            let secret = load_secret(&secret)?;
            let name = name.unwrap_or_else(|| config.device_name.clone());
            let repository = FileCredentialRepository::open(&args.credentials)?;
            rt.block_on(pair(config, secret, session, name, &repository))?;
        }
        Command::Connect {
            secret,
            device_id,
            host,
            port,
            overlay,
            mode,
            reconnect,
            once,
        } => {
            if let Some(mode) = mode {
                config.connect_mode = mode;
            }
            let mut credentials = match (secret, device_id) {
                (Some(secret), Some(device_id)) => Credentials::new(device_id, load_secret(&secret)?),
                _ => FileCredentialRepository::open(&args.credentials)?
                    .get_credentials()
                    .ok_or_else(|| {
                        anyhow!(
                            "no credentials in {}; run `pair` or pass --secret and --device-id",
                            args.credentials.display()
                        )
                    })?,
            };
            if host.is_some() {
                credentials.daemon_host = host;
            }
            if port.is_some() {
                credentials.daemon_port = port;
            }
            if overlay.is_some() {
                credentials.overlay_address = overlay;
            }
            let purpose = if reconnect {
                ConnectPurpose::Reconnect
            } else {
                ConnectPurpose::Initial
            };
            rt.block_on(connect(config, credentials, purpose, once))?;
        }
    }

    Ok(())
}

async fn pair(
    config: ClientConfig,
    secret: MasterSecret,
    session: String,
    name: String,
    repository: &FileCredentialRepository,
) -> Result<()> {
    let exchanger = PairingExchanger::new(relay(&config)?, &config);
    let request = PairingRequest::new(secret, session, name);

    match exchanger.pair(&request, repository).await {
        PairExchangeResult::Success(identity) => {
            println!("paired as {}", identity.device_id);
            println!("credentials saved to {}", repository.path().display());
            if let (Some(host), Some(port)) = (&identity.daemon_host, identity.daemon_port) {
                println!("daemon: {}:{}", host, port);
            }
            if let Some(overlay) = identity.overlay_address {
                println!("overlay: {}", overlay);
            }
            Ok(())
        }
        PairExchangeResult::AuthFailed => Err(anyhow!("daemon rejected the pairing proof")),
        PairExchangeResult::Timeout => Err(anyhow!("no pairing response from daemon")),
        PairExchangeResult::Error(reason) => Err(anyhow!("pairing failed: {}", reason)),
    }
}

async fn connect(
    config: ClientConfig,
    credentials: Credentials,
    purpose: ConnectPurpose,
    once: bool,
) -> Result<()> {
    let (progress, mut events) = ProgressSink::channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("progress: {:?}", event);
        }
    });

    let settle_delay = config.reconnect_settle_delay;
    let orchestrator = Arc::new(Orchestrator::new(config.clone()).with_relay(relay(&config)?));

    let ctx = ConnectionContext::from_credentials(&credentials, purpose, progress.clone());
    let first = match orchestrator.connect(ctx).await {
        Ok(connected) => connected,
        Err(failure) => {
            for attempt in &failure.report.attempts {
                warn!("{}: {:?} after {:?}", attempt.kind, attempt.outcome, attempt.elapsed);
            }
            if failure.error.requires_repairing() {
                return Err(anyhow!("{} (pair this device again)", failure.error));
            }
            return Err(failure.error.into());
        }
    };
    report(&first);
    if once {
        first.transport.close().await;
        return Ok(());
    }

    let repository: Arc<dyn CredentialRepository> =
        Arc::new(InMemoryCredentialRepository::with_credentials(credentials));
    let (sessions_tx, mut sessions) = mpsc::channel::<Connected>(1);
    let service = Arc::new(
        OrchestratorReconnectService::new(orchestrator.clone(), repository.clone(), sessions_tx)
            .with_progress(progress),
    );
    let controller = ReconnectController::new(
        service.clone(),
        repository,
        Arc::new(MemoryIntentStore::new()),
    )
    .with_settle_delay(settle_delay)
    .spawn();
    service.mark_connected();

    let mut current = first;
    loop {
        let received = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                current.transport.close().await;
                controller.shutdown();
                return Ok(());
            }
            received = current.transport.receive(Duration::from_secs(30)) => received,
        };

        match received {
            Ok(data) => info!("received {} bytes", data.len()),
            Err(ras_client::TransportError::Timeout) => {}
            Err(e) => {
                warn!("transport lost: {}", e);
                current.transport.close().await;
                service.mark_disconnected();
                let events = controller.subscribe();
                controller.on_connection_error(e.to_string());
                current = await_session(&controller, events, &mut sessions).await?;
                report(&current);
            }
        }
    }
}

/// Waits for the reconnect service to deliver a transport, rescheduling
/// after every failed attempt.
async fn await_session(
    controller: &ReconnectHandle,
    mut events: broadcast::Receiver<ReconnectEvent>,
    sessions: &mut mpsc::Receiver<Connected>,
) -> Result<Connected> {
    loop {
        tokio::select! {
            next = sessions.recv() => {
                return next.ok_or_else(|| anyhow!("reconnection stopped"));
            }
            event = events.recv() => match event {
                Ok(ReconnectEvent::Finished { outcome: ReconnectOutcome::Failed { kind, reason }, .. }) => {
                    if kind == "device_not_found" || kind == "authentication_failed" {
                        return Err(anyhow!("{} (pair this device again)", reason));
                    }
                    controller.on_connection_error(reason);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("reconnection stopped"));
                }
            }
        }
    }
}

fn report(connected: &Connected) {
    let transport = &connected.transport;
    println!(
        "connected via {} in {:?} (capabilities: {:?})",
        transport.kind(),
        connected.report.total,
        connected.report.capability_path
    );
    for attempt in &connected.report.attempts {
        println!("  {} {:?} {:?}", attempt.kind, attempt.outcome, attempt.elapsed);
    }
}
