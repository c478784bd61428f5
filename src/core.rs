//! Firewall core construction and lifecycle
//!
//! All collaborator handles live on one construction record, set
//! exactly once at startup; internal code takes them by reference. This
//! keeps the set-once contracts without global mutable state.

use arc_swap::ArcSwap;
use once_cell::sync::OnceCell;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::collab::{
    HostAddrs, IcmpListener, NoIcmpListener, NoPreAuth, PolicyDecider, PreAuthPorts,
    ProcessResolver, StaticHostAddrs, StreamInspector, TunnelClient,
};
use crate::config::FirewallConfig;
use crate::dispatch;
use crate::driver::InterceptionDriver;
use crate::error::{FirewallError, FirewallResult};
use crate::stats::Stats;
use crate::table::ConnectionTable;

/// Predicate matching the local nameserver's IP addresses.
pub type NameserverIpMatcher = Box<dyn Fn(IpAddr) -> bool + Send + Sync>;

struct RunningTasks {
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    stat_logger: JoinHandle<()>,
}

/// The packet-interception firewall core.
pub struct FirewallCore {
    pub(crate) driver: Arc<dyn InterceptionDriver>,
    pub(crate) policy: Arc<dyn PolicyDecider>,
    pub(crate) inspector: Option<Arc<dyn StreamInspector>>,
    pub(crate) tunnel: Option<Arc<dyn TunnelClient>>,
    pub(crate) icmp: Arc<dyn IcmpListener>,
    pub(crate) preauth: Arc<dyn PreAuthPorts>,
    pub(crate) host: Arc<dyn HostAddrs>,
    pub(crate) procs: Option<Arc<dyn ProcessResolver>>,
    pub(crate) table: ConnectionTable,
    pub(crate) stats: Stats,
    pub(crate) config: ArcSwap<FirewallConfig>,
    ns_matcher: OnceCell<NameserverIpMatcher>,
    running: Mutex<Option<RunningTasks>>,
}

impl FirewallCore {
    /// Start building a core around a driver and a policy engine.
    pub fn builder(
        driver: Arc<dyn InterceptionDriver>,
        policy: Arc<dyn PolicyDecider>,
    ) -> CoreBuilder {
        CoreBuilder {
            driver,
            policy,
            inspector: None,
            tunnel: None,
            icmp: Arc::new(NoIcmpListener),
            preauth: Arc::new(NoPreAuth),
            host: Arc::new(StaticHostAddrs::new()),
            procs: None,
            config: FirewallConfig::default(),
        }
    }

    /// Register the nameserver IP predicate. Can only be set once.
    pub fn set_nameserver_ip_matcher(&self, matcher: NameserverIpMatcher) -> FirewallResult<()> {
        self.ns_matcher
            .set(matcher)
            .map_err(|_| FirewallError::MatcherAlreadySet)
    }

    pub(crate) fn nameserver_matcher_ready(&self) -> bool {
        self.ns_matcher.get().is_some()
    }

    pub(crate) fn nameserver_matches(&self, ip: IpAddr) -> bool {
        self.ns_matcher.get().map_or(false, |matcher| matcher(ip))
    }

    /// Validate configuration ahead of `start`.
    pub fn prepare(&self) -> FirewallResult<()> {
        self.config.load().validate()
    }

    /// Wire the driver and start the dispatcher and stat logger.
    pub async fn start(self: &Arc<Self>) -> FirewallResult<()> {
        let cfg = self.config.load_full();

        if !cfg.interception_enabled {
            tracing::warn!(
                "filter: packet interception is disabled - this breaks most functionality"
            );
            return Ok(());
        }

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(FirewallError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(cfg.queue_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.driver.start(tx).await?;

        let dispatcher = tokio::spawn(dispatch::run_dispatcher(
            self.clone(),
            rx,
            shutdown_rx.clone(),
        ));
        let stat_logger = tokio::spawn(dispatch::run_stat_logger(self.clone(), shutdown_rx));

        *running = Some(RunningTasks {
            shutdown: shutdown_tx,
            dispatcher,
            stat_logger,
        });

        tracing::info!("filter: interception started via {} driver", self.driver.name());
        Ok(())
    }

    /// Stop interception: signal shutdown, stop the driver, drain.
    pub async fn stop(&self) -> FirewallResult<()> {
        let tasks = self.running.lock().await.take();
        let Some(tasks) = tasks else {
            return Ok(());
        };

        let _ = tasks.shutdown.send(true);
        self.driver.stop().await?;
        let _ = tasks.dispatcher.await;
        let _ = tasks.stat_logger.await;

        tracing::info!("filter: interception stopped");
        Ok(())
    }

    /// Swap in a new configuration.
    pub fn reload_config(&self, cfg: FirewallConfig) -> FirewallResult<()> {
        cfg.validate()?;
        self.config.store(Arc::new(cfg));
        Ok(())
    }

    /// Snapshot of the active configuration.
    pub fn active_config(&self) -> Arc<FirewallConfig> {
        self.config.load_full()
    }

    /// Packet counters and latency histogram.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The connection table, for the owning collaborator's eviction and
    /// audit walks.
    pub fn connections(&self) -> &ConnectionTable {
        &self.table
    }
}

/// Builder for [`FirewallCore`].
pub struct CoreBuilder {
    driver: Arc<dyn InterceptionDriver>,
    policy: Arc<dyn PolicyDecider>,
    inspector: Option<Arc<dyn StreamInspector>>,
    tunnel: Option<Arc<dyn TunnelClient>>,
    icmp: Arc<dyn IcmpListener>,
    preauth: Arc<dyn PreAuthPorts>,
    host: Arc<dyn HostAddrs>,
    procs: Option<Arc<dyn ProcessResolver>>,
    config: FirewallConfig,
}

impl CoreBuilder {
    /// Deep-inspection stack.
    pub fn inspector(mut self, inspector: Arc<dyn StreamInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Overlay tunnel client.
    pub fn tunnel(mut self, tunnel: Arc<dyn TunnelClient>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// ICMP observer.
    pub fn icmp_listener(mut self, icmp: Arc<dyn IcmpListener>) -> Self {
        self.icmp = icmp;
        self
    }

    /// Pre-authenticated port registry.
    pub fn pre_auth_ports(mut self, preauth: Arc<dyn PreAuthPorts>) -> Self {
        self.preauth = preauth;
        self
    }

    /// Host address oracle.
    pub fn host_addrs(mut self, host: Arc<dyn HostAddrs>) -> Self {
        self.host = host;
        self
    }

    /// Process attribution.
    pub fn process_resolver(mut self, procs: Arc<dyn ProcessResolver>) -> Self {
        self.procs = Some(procs);
        self
    }

    /// Initial configuration.
    pub fn config(mut self, config: FirewallConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the core.
    pub fn build(self) -> Arc<FirewallCore> {
        Arc::new(FirewallCore {
            driver: self.driver,
            policy: self.policy,
            inspector: self.inspector,
            tunnel: self.tunnel,
            icmp: self.icmp,
            preauth: self.preauth,
            host: self.host,
            procs: self.procs,
            table: ConnectionTable::new(),
            stats: Stats::default(),
            config: ArcSwap::from_pointee(self.config),
            ns_matcher: OnceCell::new(),
            running: Mutex::new(None),
        })
    }
}
