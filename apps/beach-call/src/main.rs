use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use beach_call_core::api::CallApiClient;
use beach_call_core::config::CallConfig;
use beach_call_core::media::{DeviceClass, SyntheticDevices};
use beach_call_core::peer::WebRtcPeerFactory;
use beach_call_core::session::{CallSession, SessionConfig, SessionDeps};
use beach_call_core::telemetry::{self, LogConfig, LogLevel};
use beach_call_core::transport::{Identity, TransportRegistry};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "beach-call", about = "Two-party call sessions over the beach relay")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr", global = true)]
    log_file: Option<PathBuf>,

    #[arg(long, env = "BEACH_CALL_API_URL", global = true)]
    api_url: Option<String>,

    #[arg(long, env = "BEACH_CALL_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a call and stay in it until Ctrl-C.
    Join(JoinArgs),
    /// Print the ICE servers the session would use.
    IceServers,
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long, env = "BEACH_CALL_RELAY_URL")]
    relay_url: Option<String>,

    #[arg(long, env = "BEACH_CALL_PARTICIPANT")]
    participant: Option<String>,

    /// Booking reference; a session is created for it before joining.
    #[arg(long)]
    reservation: Option<String>,

    /// Rejoin an existing session instead of creating one.
    #[arg(long)]
    session: Option<String>,

    #[arg(long, env = "BEACH_CALL_DEVICE_CLASS")]
    device_class: Option<DeviceClass>,

    /// Join without camera or microphone.
    #[arg(long)]
    receive_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = CallConfig::from_env();
    let api_url = cli.api_url.clone().unwrap_or_else(|| config.api_url.clone());
    let token = cli.token.clone().or_else(|| config.token.clone());

    match cli.command {
        Command::IceServers => {
            let client = CallApiClient::new(api_url, token.unwrap_or_default());
            let servers = client.ice_servers().await;
            println!("{}", serde_json::to_string_pretty(&servers)?);
            Ok(())
        }
        Command::Join(args) => join(config, api_url, token, args).await,
    }
}

async fn join(
    config: CallConfig,
    api_url: String,
    token: Option<String>,
    args: JoinArgs,
) -> Result<()> {
    let Some(token) = token else {
        bail!("a relay token is required (--token or BEACH_CALL_TOKEN)");
    };
    let participant = args
        .participant
        .or(config.participant_id.clone())
        .context("a participant id is required (--participant or BEACH_CALL_PARTICIPANT)")?;
    let relay_url = args.relay_url.unwrap_or(config.relay_url.clone());
    let api = CallApiClient::new(api_url, token.clone());

    let mut session_id = args.session;
    let mut reservation_id = args.reservation;
    if session_id.is_none() {
        if let Some(reservation) = reservation_id.as_deref() {
            let grant = api
                .create_session(reservation)
                .await
                .context("failed to create session")?;
            eprintln!(
                "session {} created (valid {}s)",
                grant.session_id, grant.ttl_seconds
            );
            session_id = Some(grant.session_id);
            reservation_id = Some(grant.reservation_id);
        }
    }

    let mut session_config = SessionConfig::new(
        Identity::new(participant, token),
        config.timings.transport(relay_url),
    );
    session_config.session_id = session_id;
    session_config.reservation_id = reservation_id;
    session_config.device_class = args.device_class.unwrap_or(config.device_class);
    session_config.ice_servers = api.ice_servers().await;
    session_config.grace_window = config.timings.grace_window;
    session_config.waiting_tick = config.timings.waiting_tick;

    let devices = if args.receive_only {
        SyntheticDevices::denying_user_media()
    } else {
        SyntheticDevices::new()
    };
    let deps = SessionDeps {
        registry: TransportRegistry::global(),
        peers: Arc::new(WebRtcPeerFactory::new()?),
        devices: Arc::new(devices),
    };

    let handle = CallSession::start(session_config, deps)?;
    let mut status = handle.subscribe_status();
    eprintln!("status: {:?}", *status.borrow());

    let termination = loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break handle.wait_for_termination().await;
                }
                let current = *status.borrow_and_update();
                eprintln!("status: {current:?}");
                if current.is_terminal() {
                    break handle.wait_for_termination().await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.end().await;
                break handle.wait_for_termination().await;
            }
        }
    };
    eprintln!("call ended: {termination:?}");

    match api.call_metrics().await {
        Ok(metrics) => println!("{}", serde_json::to_string_pretty(&metrics)?),
        Err(err) => eprintln!("call metrics unavailable: {err}"),
    }
    Ok(())
}
