use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use caramba_xray::identity::{Identity, ListenPath};
use caramba_xray::probe::{NetworkProbe, ProbeSource, UNKNOWN_LABEL};
use caramba_xray::provision::ArchiveFetcher;
use caramba_xray::settings::{DEFAULT_RELEASE_URL, MemoryHint, Settings, resolve_port};
use caramba_xray::supervisor::Launcher;
use caramba_xray::{HttpFetcher, Provisioner, SubscriptionLink, Supervisor, XrayLauncher};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod shutdown;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Public domain served through the edge proxy (e.g. Cloudflare orange cloud)
    #[arg(short, long, env = "DOMAIN", default_value = "example.com")]
    domain: String,

    /// VLESS client UUID (generated when empty)
    #[arg(short, long, env = "UUID")]
    uuid: Option<String>,

    /// Local listen port; falls back to SERVER_PORT
    #[arg(short, long, env = "PORT")]
    port: Option<String>,

    /// Node name prefix shown in clients
    #[arg(long, env = "NODE_NAME", default_value = "Panel")]
    node_name: String,

    /// WebSocket path (derived from the UUID when empty)
    #[arg(long, env = "WSPATH")]
    ws_path: Option<String>,

    /// Port advertised in the subscription link
    #[arg(long, env = "PUBLIC_PORT", default_value_t = 443)]
    public_port: u16,

    /// Advertise a plain (non-TLS) endpoint
    #[arg(long, env = "NO_TLS")]
    no_tls: bool,

    /// Directory for the config, the link file and the Xray binary
    #[arg(long, env = "WORK_DIR", default_value = ".")]
    work_dir: PathBuf,

    /// Xray log level
    #[arg(long, env = "XRAY_LOG_LEVEL", default_value = "error")]
    log_level: String,

    /// Seconds between liveness checks
    #[arg(long, env = "POLL_INTERVAL", default_value_t = 30)]
    poll_interval: u64,

    /// Give up after this many restarts (unlimited when unset)
    #[arg(long, env = "MAX_RESTARTS")]
    max_restarts: Option<u32>,

    /// Seconds to wait after SIGTERM before killing Xray
    #[arg(long, env = "STOP_TIMEOUT", default_value_t = 5)]
    stop_timeout: u64,

    /// Per-endpoint timeout for the ISP lookup, in seconds
    #[arg(long, env = "PROBE_TIMEOUT", default_value_t = 5)]
    probe_timeout: u64,

    /// Upper bound on the Xray archive download, in seconds
    #[arg(long, env = "DOWNLOAD_TIMEOUT", default_value_t = 300)]
    download_timeout: u64,

    /// Base URL of the Xray-core release assets
    #[arg(long, env = "XRAY_RELEASE_URL", default_value = DEFAULT_RELEASE_URL)]
    release_url: String,

    #[arg(long, env = "GOMEMLIMIT_HINT", default_value = "15MiB")]
    gomemlimit: String,

    #[arg(long, env = "GOGC_HINT", default_value = "15")]
    gogc: String,
}

fn build_settings(args: &Args) -> caramba_xray::Result<Settings> {
    let fallback_port = std::env::var("SERVER_PORT").ok();
    let listen_port = resolve_port(args.port.as_deref(), fallback_port.as_deref())?;
    let identity = Identity::resolve(args.uuid.as_deref())?;

    let mut settings = Settings::new(args.domain.trim(), identity, listen_port);
    settings.listen_path = ListenPath::resolve(args.ws_path.as_deref(), &settings.identity);
    settings.public_port = args.public_port;
    settings.tls = !args.no_tls;
    settings.node_name = args.node_name.trim().to_string();
    settings.work_dir = args.work_dir.clone();
    settings.log_level = args.log_level.clone();
    settings.poll_interval = Duration::from_secs(args.poll_interval.max(1));
    settings.stop_timeout = Duration::from_secs(args.stop_timeout);
    settings.max_restarts = args.max_restarts;
    settings.release_url = args.release_url.clone();
    settings.memory_hint = MemoryHint {
        gomemlimit: args.gomemlimit.clone(),
        gogc: args.gogc.clone(),
    };
    Ok(settings)
}

async fn lookup_label(timeout: Duration) -> String {
    match NetworkProbe::new(ProbeSource::defaults(), timeout) {
        Ok(probe) => probe.lookup_label().await,
        Err(e) => {
            warn!("⚠️ {}", e);
            UNKNOWN_LABEL.to_string()
        }
    }
}

fn print_banner(link: &SubscriptionLink) {
    let rule = "=".repeat(60);
    println!("\n{}", rule);
    println!("🔗 VLESS subscription (base64):");
    println!("{}", link.encoded());
    println!("{}\n", rule);
}

/// First launch, supervision and cleanup. Returns the process exit code.
async fn supervise<F: ArchiveFetcher, L: Launcher>(
    supervisor: &mut Supervisor<F, L>,
    shutdown: CancellationToken,
) -> i32 {
    let started = tokio::select! {
        _ = shutdown.cancelled() => {
            info!("🛑 Shutdown requested during startup");
            None
        }
        outcome = supervisor.start() => Some(outcome),
    };

    let code = match started {
        None => 0,
        Some(Err(e)) => {
            error!("❌ Failed to start Xray: {}", e);
            1
        }
        Some(Ok(())) => {
            info!("✅ Service running on port {}", supervisor.settings().listen_port);
            match supervisor.run(shutdown).await {
                Ok(()) => 0,
                Err(e) => {
                    error!("❌ Supervisor gave up: {}", e);
                    1
                }
            }
        }
    };

    if let Err(e) = supervisor.stop().await {
        error!("❌ Cleanup failed: {}", e);
        return 1;
    }
    code
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Before the subscriber, so RUST_LOG from .env applies.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("🚀 Caramba Edge v{} starting...", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let settings = match build_settings(&args) {
        Ok(s) => s,
        Err(e) => {
            error!("❌ {}", e);
            exit(1);
        }
    };

    info!("🌐 Domain: {}", settings.domain);
    info!("🔑 UUID: {}", settings.identity);
    info!("🛣️ Path: {}", settings.listen_path);
    info!("📁 Work dir: {}", settings.work_dir.display());

    let shutdown = shutdown::listen();

    let label = tokio::select! {
        _ = shutdown.cancelled() => {
            info!("👋 Stopped");
            return Ok(());
        }
        label = lookup_label(Duration::from_secs(args.probe_timeout)) => label,
    };
    let name = settings.display_name(&label);
    let link = SubscriptionLink::build(&settings.identity, &settings.endpoint(), &name);
    link.write_to(&settings.link_path()).await;
    print_banner(&link);

    let fetcher = match HttpFetcher::bounded(
        Duration::from_secs(10),
        Duration::from_secs(args.download_timeout.max(1)),
    ) {
        Ok(f) => f,
        Err(e) => {
            error!("❌ {}", e);
            exit(1);
        }
    };
    let provisioner = Provisioner::new(fetcher, &settings);
    let mut supervisor = Supervisor::new(settings, provisioner, XrayLauncher);

    let code = supervise(&mut supervisor, shutdown).await;
    if code != 0 {
        exit(code);
    }

    info!("👋 Stopped");
    Ok(())
}
