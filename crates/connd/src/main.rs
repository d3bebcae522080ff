// # connd - Connection Manager Daemon
//
// Thin integration layer over connd-core. It owns no policy: it reads
// configuration, builds the primitives, wires the kernel route feed into
// the RouteWatcher and waits for a shutdown signal.
//
// The daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing tracing and the runtime
// 3. Constructing RouteWatcher, NotifierRegistry and TaskManager
// 4. Running the RTNL engine, resubscribing when the feed is lost
// 5. Stopping helper tasks on shutdown
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Logging
// - `CONND_LOG_LEVEL`: trace, debug, info, warn, error (default: info)
//
// ### Route feed
// - `CONND_RTNL_LINK`: subscribe to link events (default: true)
// - `CONND_RTNL_IPV4_ROUTES`: subscribe to IPv4 route events (default: true)
// - `CONND_RTNL_IPV6_ROUTES`: subscribe to IPv6 route events (default: true)
// - `CONND_RTNL_BUFFER`: socket receive buffer in bytes (default: 32768)
//
// ### Helper tasks
// - `CONND_TASK_PATH_PREFIX`: object path prefix (default: /task)
// - `CONND_BUS_NAME`: bus name handed to helpers (default: net.connd)
// - `CONND_TASK_STOP_TIMEOUT_MS`: SIGTERM to SIGKILL grace (default: 5000)
//
// ### Engine
// - `CONND_RESUBSCRIBE_ATTEMPTS`: consecutive feed resubscriptions before giving up (default: 3)
//
// ## Example
//
// ```bash
// export CONND_LOG_LEVEL=debug
// export CONND_RTNL_IPV6_ROUTES=false
// export CONND_TASK_STOP_TIMEOUT_MS=2000
//
// connd
// ```

use anyhow::{Context, Result};
use connd_core::rtnl::{ANY_INDEX, link_flags};
use connd_core::{
    ConndConfig, EngineEvent, NetworkState, Notifier, NotifierRegistry, RouteWatcher, RtnlEngine,
    RtnlObserver, Service, ServiceState, TaskManager,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum ConndExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (feed lost for good, signal setup failure)
    RuntimeError = 2,
}

impl From<ConndExitCode> for ExitCode {
    fn from(code: ConndExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// A subscription that lasted this long counts as recovered
const STABLE_SUBSCRIPTION: Duration = Duration::from_secs(60);

/// Limits resubscriptions after consecutive feed losses
///
/// A loss that ends a subscription which stayed up for at least
/// [`STABLE_SUBSCRIPTION`] starts a new run of failures, so occasional
/// overflows over a long uptime never exhaust the budget.
#[derive(Debug)]
struct ResubscribeBudget {
    limit: u32,
    consecutive: u32,
}

impl ResubscribeBudget {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    /// Record a loss after a subscription that ran for `uptime`
    ///
    /// Returns whether another resubscription is allowed.
    fn allow(&mut self, uptime: Duration) -> bool {
        if uptime >= STABLE_SUBSCRIPTION {
            self.consecutive = 0;
        }
        if self.consecutive >= self.limit {
            return false;
        }
        self.consecutive += 1;
        true
    }

    fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Application configuration
struct Config {
    core: ConndConfig,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let mut core = ConndConfig::new();

        if let Some(v) = env_parse("CONND_RTNL_LINK")? {
            core.rtnl.link_events = v;
        }
        if let Some(v) = env_parse("CONND_RTNL_IPV4_ROUTES")? {
            core.rtnl.ipv4_routes = v;
        }
        if let Some(v) = env_parse("CONND_RTNL_IPV6_ROUTES")? {
            core.rtnl.ipv6_routes = v;
        }
        if let Some(v) = env_parse("CONND_RTNL_BUFFER")? {
            core.rtnl.receive_buffer_size = v;
        }
        if let Ok(prefix) = env::var("CONND_TASK_PATH_PREFIX") {
            core.task.path_prefix = prefix;
        }
        if let Ok(bus_name) = env::var("CONND_BUS_NAME") {
            core.task.bus_name = bus_name;
        }
        if let Some(v) = env_parse("CONND_TASK_STOP_TIMEOUT_MS")? {
            core.task.stop_timeout_ms = v;
        }
        if let Some(v) = env_parse("CONND_RESUBSCRIBE_ATTEMPTS")? {
            core.engine.resubscribe_attempts = v;
        }

        Ok(Self {
            core,
            log_level: env::var("CONND_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        self.core.validate()?;

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "CONND_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        if self.core.task.stop_timeout_ms > 60_000 {
            anyhow::bail!(
                "CONND_TASK_STOP_TIMEOUT_MS must be at most 60000. Got: {}",
                self.core.task.stop_timeout_ms
            );
        }

        Ok(())
    }
}

/// Read and parse an optional environment variable
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ConndExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return ConndExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return ConndExitCode::ConfigError.into();
    }

    info!("Starting connd daemon");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return ConndExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config.core).await {
            error!("Daemon error: {:#}", e);
            ConndExitCode::RuntimeError
        } else {
            ConndExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon
async fn run_daemon(config: ConndConfig) -> Result<()> {
    let watcher = Arc::new(RouteWatcher::new());
    let notifiers = Arc::new(NotifierRegistry::new());
    let tasks = TaskManager::new(config.task.clone())?;

    let gateways = Arc::new(DefaultRouteObserver::default());
    watcher.register(gateways.clone())?;
    notifiers.register(Arc::new(LoggingNotifier))?;

    let link_watch = watcher.add_newlink_watch(ANY_INDEX, |flags, change| {
        if change & (link_flags::IFF_UP | link_flags::IFF_LOWER_UP) != 0 {
            let up = flags & link_flags::IFF_UP != 0;
            let carrier = flags & link_flags::IFF_LOWER_UP != 0;
            debug!(up, carrier, "link flags 0x{:05x}", flags);
        }
    });

    let mut state_rx = notifiers.subscribe_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state: NetworkState = *state_rx.borrow_and_update();
            info!(%state, "network state changed");
        }
    });

    let feed = create_feed(&config)?;
    let (engine, mut events) = RtnlEngine::new(feed, Arc::clone(&watcher), &config.engine)?;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::FeedLost { reason } => warn!(%reason, "route feed lost"),
                other => debug!(?other, "engine event"),
            }
        }
    });

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    let mut budget = ResubscribeBudget::new(config.engine.resubscribe_attempts);
    let outcome = loop {
        let started = Instant::now();
        match engine.run_until(shutdown.as_mut()).await {
            Ok(()) => break Ok(()),
            Err(e) if e.is_feed_lost() && budget.allow(started.elapsed()) => {
                warn!(
                    attempt = budget.consecutive(),
                    max = config.engine.resubscribe_attempts,
                    "Resubscribing after feed loss: {}",
                    e
                );
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
            Err(e) => {
                break Err(anyhow::Error::new(e).context(format!(
                    "route feed lost after {} consecutive resubscription(s)",
                    budget.consecutive()
                )));
            }
        }
    };

    watcher.remove_watch(link_watch);
    let stopped = tasks.shutdown();
    info!(
        stopped,
        gateways = gateways.len(),
        "Shutting down daemon"
    );

    outcome
}

#[cfg(feature = "netlink")]
fn create_feed(config: &ConndConfig) -> Result<Box<dyn connd_core::RouteFeed>> {
    use connd_core::RouteFeedFactory;

    connd_rtnl_netlink::NetlinkFeedFactory
        .create(&config.rtnl)
        .context("Failed to create netlink route feed")
}

#[cfg(not(feature = "netlink"))]
fn create_feed(_config: &ConndConfig) -> Result<Box<dyn connd_core::RouteFeed>> {
    anyhow::bail!("connd was built without a route feed; enable the 'netlink' feature")
}

/// Tracks the default gateway of each interface
#[derive(Default)]
struct DefaultRouteObserver {
    gateways: Mutex<HashMap<u32, IpAddr>>,
}

impl DefaultRouteObserver {
    fn len(&self) -> usize {
        self.gateways.lock().len()
    }
}

impl RtnlObserver for DefaultRouteObserver {
    fn name(&self) -> &str {
        "default-route"
    }

    fn newgateway(&self, index: u32, gateway: &IpAddr) {
        let previous = self.gateways.lock().insert(index, *gateway);
        match previous {
            Some(old) if old == *gateway => {}
            Some(old) => info!(index, %old, new = %gateway, "default gateway changed"),
            None => info!(index, %gateway, "default gateway added"),
        }
    }

    fn delgateway(&self, index: u32, gateway: &IpAddr) {
        let mut gateways = self.gateways.lock();
        if gateways.get(&index) == Some(gateway) {
            gateways.remove(&index);
            info!(index, %gateway, "default gateway removed");
        }
    }

    fn dellink(&self, _link_type: u16, index: u32, _flags: u32, _change: u32) {
        if let Some(gateway) = self.gateways.lock().remove(&index) {
            info!(index, %gateway, "link removed, dropping default gateway");
        }
    }
}

/// Logs service-level notifications
struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn default_changed(&self, service: Option<&dyn Service>) {
        match service {
            Some(service) => info!(service = service.identifier(), "default service changed"),
            None => info!("no default service"),
        }
    }

    fn service_state_changed(&self, service: &dyn Service, state: ServiceState) {
        debug!(service = service.identifier(), %state, "service state changed");
    }

    fn offline_mode(&self, enabled: bool) {
        info!(enabled, "offline mode");
    }

    fn idle_state(&self, idle: bool) {
        debug!(idle, "idle state");
    }
}

/// Wait for SIGTERM or SIGINT
///
/// If the handlers cannot be installed the daemon cannot be stopped
/// cleanly, so the error is logged and the future resolves at once.
#[cfg(unix)]
async fn wait_for_shutdown() {
    let handlers = signal(SignalKind::terminate())
        .and_then(|term| Ok((term, signal(SignalKind::interrupt())?)));

    let (mut sigterm, mut sigint) = match handlers {
        Ok(handlers) => handlers,
        Err(e) => {
            error!("Failed to set up signal handlers: {}", e);
            return;
        }
    };

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!("Received shutdown signal: {}", received);
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for CTRL-C: {}", e);
        return;
    }
    info!("Received shutdown signal: SIGINT");
}
