use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use signal_bus::{BusError, LocalBus, PeerId, SignalBus};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info};
use voice_call_core::call::{
    CallController, CallError, CallNotice, CallSetup, CallState, CallStatus, CallUpdate,
};
use voice_call_core::config::Config;
use voice_call_core::media::SyntheticCapture;
use voice_call_core::playback::LoggingSink;
use voice_call_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use voice_call_core::transport::PeerError;
use voice_call_core::transport::webrtc::{WebRtcConnector, virtual_pair};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEMO_SESSION: &str = "demo";

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = Config::from_env();
    match cli.command {
        Command::Demo => handle_demo(config).await,
        Command::Join(args) => handle_join(config, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "voice-call",
    about = "📞 Peer-to-peer voice calls negotiated over a signaling relay",
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "VOICE_CALL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "VOICE_CALL_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run two in-process peers through a full call
    Demo,
    /// Join a session and control the call from stdin
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long, short = 's', value_name = "CODE", help = "Session code shared by both peers")]
    session: String,

    #[arg(
        long,
        value_name = "URL",
        help = "Redis relay url (defaults to VOICE_CALL_RELAY_URL)"
    )]
    relay: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Call(#[from] CallError),
    #[error("transport setup failed: {0}")]
    Transport(#[from] PeerError),
    #[error("signal relay error: {0}")]
    Relay(#[from] BusError),
    #[error("no relay configured; pass --relay or set VOICE_CALL_RELAY_URL")]
    MissingRelay,
    #[error("this build has no Redis relay; rebuild with --features redis-relay")]
    RelayUnsupported,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

async fn handle_demo(config: Config) -> Result<(), CliError> {
    let bus: Arc<dyn SignalBus> = Arc::new(LocalBus::new());
    let (left, right) = virtual_pair(&config).await?;
    let left = Arc::new(left);
    let right = Arc::new(right);

    let alice = spawn_endpoint(&config, Arc::clone(&bus), DEMO_SESSION, left.clone()).await?;
    let bob = spawn_endpoint(&config, Arc::clone(&bus), DEMO_SESSION, right.clone()).await?;
    print_updates("alice", alice.subscribe_updates());
    print_updates("bob", bob.subscribe_updates());

    println!("📞 alice ({}) calls bob ({})", alice.local_peer(), bob.local_peer());
    alice.start_call().await?;
    wait_for_state(alice.watch_status(), CallState::Connected, "alice to connect").await?;
    wait_for_state(bob.watch_status(), CallState::Connected, "bob to connect").await?;

    sleep(Duration::from_secs(1)).await;
    let status = alice.toggle_mute().await?;
    println!("🔇 alice muted: {}", status.muted);
    sleep(Duration::from_millis(500)).await;
    let status = alice.toggle_mute().await?;
    println!("🔊 alice muted: {}", status.muted);
    sleep(Duration::from_millis(500)).await;

    println!(
        "📦 audio packets received: alice={} bob={}",
        left.inbound_packets(),
        right.inbound_packets()
    );
    alice.hangup().await?;
    println!("👋 alice hung up");
    wait_for_state(bob.watch_status(), CallState::Idle, "bob to notice the hangup").await?;

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

async fn handle_join(config: Config, args: JoinArgs) -> Result<(), CliError> {
    let relay = args
        .relay
        .or_else(|| config.relay_url.clone())
        .ok_or(CliError::MissingRelay)?;
    let bus = connect_relay(&relay).await?;
    let connector = Arc::new(WebRtcConnector::new(&config)?);
    let controller = spawn_endpoint(&config, bus, &args.session, connector).await?;
    print_updates("call", controller.subscribe_updates());

    println!(
        "🎧 joined session {} as {}; commands: call, mute, hangup, status, quit",
        controller.session_id(),
        controller.local_peer()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let outcome = match line.trim() {
            "" => continue,
            "call" => controller.start_call().await,
            "mute" => controller.toggle_mute().await,
            "hangup" => controller.hangup().await,
            "status" => controller.current_status().await,
            "quit" | "exit" => break,
            other => {
                println!("unknown command '{other}'");
                continue;
            }
        };
        match outcome {
            Ok(status) => println!("{}", describe(status)),
            Err(CallError::Closed) => return Err(CallError::Closed.into()),
            Err(err) => println!("⚠️  {err}"),
        }
    }
    controller.shutdown().await;
    Ok(())
}

#[cfg(feature = "redis-relay")]
async fn connect_relay(url: &str) -> Result<Arc<dyn SignalBus>, CliError> {
    let bus = signal_bus::RedisBus::connect(url).await?;
    info!(target = "voice.call", url, "connected to redis relay");
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "redis-relay"))]
async fn connect_relay(url: &str) -> Result<Arc<dyn SignalBus>, CliError> {
    info!(target = "voice.call", url, "redis relay requested but not compiled in");
    Err(CliError::RelayUnsupported)
}

async fn spawn_endpoint(
    config: &Config,
    bus: Arc<dyn SignalBus>,
    session_id: &str,
    connector: Arc<WebRtcConnector>,
) -> Result<CallController, CliError> {
    let controller = CallController::spawn(CallSetup {
        session_id: session_id.to_string(),
        local_peer: PeerId::generate(),
        bus,
        connector,
        capture: Arc::new(SyntheticCapture::new()),
        playback: Arc::new(LoggingSink),
        constraints: config.capture,
    })
    .await?;
    Ok(controller)
}

async fn wait_for_state(
    mut status: watch::Receiver<CallStatus>,
    state: CallState,
    what: &'static str,
) -> Result<(), CliError> {
    match timeout(CONNECT_TIMEOUT, status.wait_for(|status| status.state == state)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(CallError::Closed.into()),
        Err(_) => Err(CliError::Timeout(what)),
    }
}

fn print_updates(name: &'static str, mut updates: broadcast::Receiver<CallUpdate>) {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(CallUpdate::Status(status)) => println!("[{name}] {}", describe(status)),
                Ok(CallUpdate::Notice(notice)) => println!("[{name}] {}", describe_notice(&notice)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn describe(status: CallStatus) -> String {
    if status.muted {
        format!("state={} (muted)", status.state)
    } else {
        format!("state={}", status.state)
    }
}

fn describe_notice(notice: &CallNotice) -> String {
    match notice {
        CallNotice::Calling => "📤 calling...".to_string(),
        CallNotice::IncomingCall => "📥 incoming call answered".to_string(),
        CallNotice::MediaUnavailable { reason } => format!("🎙️  microphone unavailable: {reason}"),
        CallNotice::ConnectionLost => "📴 connection lost".to_string(),
        CallNotice::Failed { reason } => format!("❌ call failed: {reason}"),
    }
}
