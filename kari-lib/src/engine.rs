//! The control surface: admitted-interface and profile registries, traffic
//! lifecycle, stats aggregation, and config snapshot/restore.
//!
//! One engine value owns everything; configuration mutations serialize
//! through a single coarse registry lock, stats reads go through atomic
//! counters, and long operations run in background tasks that release the
//! lock immediately.

use ahash::RandomState;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::bgp::{BgpConfig, BgpCountersSnapshot, BgpSession, Route};
use crate::codec::MacAddr;
use crate::config::{
    validate_interface, validate_profile, EngineSnapshot, InterfaceConfig, TrafficProfile,
};
use crate::error::{EngineError, Result};
use crate::iface::{accel, discover, spawn_ingest, Interface, IngestHandle};
use crate::impair::ImpairmentStatsSnapshot;
use crate::netflow::{spawn_generator, NetflowConfig, NetflowHandle};
use crate::pool::{PacketPool, PoolStats};
use crate::rfc2544::{
    InterfaceTrialLink, Rfc2544Harness, Rfc2544Report, TestKind, HarnessOptions,
};
use crate::sched::{self, worker, ProfileStats, ProfileStatsSnapshot, WorkerHandle};
use crate::tcp::{L2SegmentTx, TcpEngine, TcpEngineConfig, TcpPoolStats};

pub type IfaceFactory = dyn Fn(InterfaceConfig) -> Result<Arc<Interface>> + Send + Sync;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub pool_capacity: usize,
    pub pool_buf_size: usize,
    pub tcp: TcpEngineConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pool_capacity: crate::pool::DEFAULT_CAPACITY,
            pool_buf_size: crate::pool::DEFAULT_BUF_SIZE,
            tcp: TcpEngineConfig::default(),
        }
    }
}

#[derive(Default)]
struct Registry {
    interfaces: HashMap<String, Arc<Interface>, RandomState>,
    profiles: HashMap<String, TrafficProfile, RandomState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub running: bool,
    pub interfaces: BTreeMap<String, crate::iface::IfaceStatsSnapshot>,
    pub profiles: BTreeMap<String, ProfileStatsSnapshot>,
    pub impairments: BTreeMap<String, ImpairmentStatsSnapshot>,
    pub pool: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpPoolStats>,
}

pub struct Engine {
    opts: EngineOptions,
    registry: Mutex<Registry>,
    pool: Arc<PacketPool>,
    iface_factory: Box<IfaceFactory>,
    impairments_enabled: Arc<AtomicBool>,
    running: AtomicBool,
    workers: Mutex<Vec<WorkerHandle>>,
    profile_stats: Mutex<HashMap<String, Arc<ProfileStats>, RandomState>>,
    rfc_results: Mutex<HashMap<String, Rfc2544Report, RandomState>>,
    rfc_cancel: Mutex<Option<Arc<AtomicBool>>>,
    tcp: Mutex<Option<Arc<TcpEngine>>>,
    tcp_ingest: Mutex<Vec<IngestHandle>>,
    bgp: tokio::sync::Mutex<Option<Arc<BgpSession>>>,
    netflow: Mutex<Option<NetflowHandle>>,
    tasks: TaskTracker,
}

impl Engine {
    pub fn new(opts: EngineOptions) -> Result<Arc<Self>> {
        Self::with_iface_factory(opts, Box::new(|cfg| Interface::open(cfg, true)))
    }

    /// Engine with an injected interface factory (test doubles).
    pub fn with_iface_factory(opts: EngineOptions, factory: Box<IfaceFactory>) -> Result<Arc<Self>> {
        let pool = PacketPool::new(opts.pool_capacity, opts.pool_buf_size)?;
        Ok(Arc::new(Self {
            opts,
            registry: Mutex::new(Registry::default()),
            pool,
            iface_factory: factory,
            impairments_enabled: Arc::new(AtomicBool::new(true)),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            profile_stats: Mutex::new(HashMap::with_hasher(RandomState::default())),
            rfc_results: Mutex::new(HashMap::with_hasher(RandomState::default())),
            rfc_cancel: Mutex::new(None),
            tcp: Mutex::new(None),
            tcp_ingest: Mutex::new(Vec::new()),
            bgp: tokio::sync::Mutex::new(None),
            netflow: Mutex::new(None),
            tasks: TaskTracker::new(),
        }))
    }

    pub fn pool(&self) -> Arc<PacketPool> {
        Arc::clone(&self.pool)
    }

    // ---- interface registry ----

    pub fn admit_interface(&self, cfg: InterfaceConfig) -> Result<InterfaceConfig> {
        validate_interface(&cfg)?;
        let mut registry = self.registry.lock().unwrap();
        if registry.interfaces.contains_key(&cfg.name) {
            return Err(EngineError::Config(format!(
                "interface {} already admitted",
                cfg.name
            )));
        }
        let name = cfg.name.clone();
        let iface = (self.iface_factory)(cfg)?;
        let admitted = iface.config();
        registry.interfaces.insert(name.clone(), iface);
        info!(interface = %name, "interface admitted");
        Ok(admitted)
    }

    pub fn interface(&self, name: &str) -> Result<Arc<Interface>> {
        self.registry
            .lock()
            .unwrap()
            .interfaces
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownInterface(name.to_string()))
    }

    pub fn list_interfaces(&self) -> Vec<InterfaceConfig> {
        let registry = self.registry.lock().unwrap();
        let mut configs: Vec<_> = registry.interfaces.values().map(|i| i.config()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Refreshes live MAC/IP from the OS. First observed wins: operator-
    /// supplied addresses are preserved, only unset fields are filled.
    pub fn discover_interface(&self, name: &str) -> Result<InterfaceConfig> {
        let iface = self.interface(name)?;
        let observed = discover::discover(name)?;
        iface.update_config(|cfg| {
            if let Some(mac) = observed.mac {
                cfg.mac_address = mac;
            }
            if cfg.ip_address.is_none() {
                cfg.ip_address = observed.ipv4;
            }
            if cfg.ipv6_address.is_none() {
                cfg.ipv6_address = observed.ipv6;
            }
        });
        let updated = iface.config();
        info!(interface = %name, ip = ?updated.ip_address, "interface discovery refreshed");
        Ok(updated)
    }

    // ---- profile registry ----

    /// Resolves a named impairment preset into the profile's impairment
    /// record. An explicit record wins over the preset.
    fn resolve_preset(profile: &mut TrafficProfile) -> Result<()> {
        if let Some(name) = &profile.impairment_preset {
            let preset = crate::config::ImpairmentConfig::preset(name).ok_or_else(|| {
                EngineError::Config(format!("unknown impairment preset {name:?}"))
            })?;
            if profile.impairments == crate::config::ImpairmentConfig::default() {
                profile.impairments = preset;
            }
        }
        Ok(())
    }

    pub fn add_profile(&self, mut profile: TrafficProfile) -> Result<()> {
        Self::resolve_preset(&mut profile)?;
        let mut registry = self.registry.lock().unwrap();
        let interfaces: HashMap<String, InterfaceConfig> = registry
            .interfaces
            .iter()
            .map(|(k, v)| (k.clone(), v.config()))
            .collect();
        validate_profile(&profile, &interfaces)?;
        if registry.profiles.contains_key(&profile.name) {
            return Err(EngineError::Config(format!(
                "profile {} already exists",
                profile.name
            )));
        }
        info!(profile = %profile.name, rate_mbps = profile.bandwidth_mbps, "profile added");
        registry.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn update_profile(&self, name: &str, mut profile: TrafficProfile) -> Result<()> {
        if name != profile.name {
            return Err(EngineError::Config(
                "profile name does not match the path".into(),
            ));
        }
        Self::resolve_preset(&mut profile)?;
        let mut registry = self.registry.lock().unwrap();
        let interfaces: HashMap<String, InterfaceConfig> = registry
            .interfaces
            .iter()
            .map(|(k, v)| (k.clone(), v.config()))
            .collect();
        validate_profile(&profile, &interfaces)?;
        if !registry.profiles.contains_key(name) {
            return Err(EngineError::UnknownProfile(name.to_string()));
        }
        registry.profiles.insert(name.to_string(), profile);
        Ok(())
    }

    pub fn remove_profile(&self, name: &str) -> Result<()> {
        self.registry
            .lock()
            .unwrap()
            .profiles
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::UnknownProfile(name.to_string()))
    }

    pub fn profile(&self, name: &str) -> Result<TrafficProfile> {
        self.registry
            .lock()
            .unwrap()
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProfile(name.to_string()))
    }

    pub fn list_profiles(&self) -> Vec<TrafficProfile> {
        let registry = self.registry.lock().unwrap();
        let mut profiles: Vec<_> = registry.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    // ---- traffic lifecycle ----

    /// Spawns one worker per enabled profile. Profiles whose endpoints or
    /// templates fail resolve are logged and skipped, not fatal.
    pub fn start_traffic(&self) -> Result<usize> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let registry = self.registry.lock().unwrap();
        let mut started = 0;
        let mut stats_map = self.profile_stats.lock().unwrap();
        let mut workers = self.workers.lock().unwrap();
        for profile in registry.profiles.values().filter(|p| p.enabled) {
            let Some(src) = registry.interfaces.get(&profile.src_interface) else {
                warn!(profile = %profile.name, iface = %profile.src_interface, "missing source interface, skipping profile");
                continue;
            };
            let Some(dst) = registry.interfaces.get(&profile.dst_interface) else {
                warn!(profile = %profile.name, iface = %profile.dst_interface, "missing destination interface, skipping profile");
                continue;
            };
            let template = match sched::build_template(profile, &src.config(), &dst.config()) {
                Ok(template) => template,
                Err(err) => {
                    warn!(profile = %profile.name, %err, "template build failed, skipping profile");
                    continue;
                }
            };
            let stats = stats_map
                .entry(profile.name.clone())
                .or_insert_with(|| Arc::new(ProfileStats::default()))
                .clone();
            workers.push(worker::spawn(
                profile.clone(),
                Arc::clone(src),
                Arc::clone(&self.pool),
                stats,
                Arc::clone(&self.impairments_enabled),
                template,
            ));
            started += 1;
        }
        info!(workers = started, "traffic started");
        Ok(started)
    }

    /// Cooperative stop: workers exit at the next batch boundary, each joined
    /// under the 2 s deadline.
    pub fn stop_traffic(&self) {
        self.running.store(false, Ordering::SeqCst);
        let drained: Vec<WorkerHandle> = self.workers.lock().unwrap().drain(..).collect();
        let count = drained.len();
        for handle in drained {
            handle.stop();
        }
        if count > 0 {
            info!(workers = count, "traffic stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_impairments_enabled(&self, enabled: bool) {
        self.impairments_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "global impairments toggled");
    }

    pub fn impairments_enabled(&self) -> bool {
        self.impairments_enabled.load(Ordering::SeqCst)
    }

    // ---- stats ----

    pub fn stats(&self) -> StatsSnapshot {
        let registry = self.registry.lock().unwrap();
        let interfaces = registry
            .interfaces
            .iter()
            .map(|(name, iface)| (name.clone(), iface.stats().snapshot()))
            .collect();
        drop(registry);
        let profiles = self
            .profile_stats
            .lock()
            .unwrap()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        let impairments = self
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|w| (w.name().to_string(), w.impair_stats().snapshot()))
            .collect();
        StatsSnapshot {
            running: self.is_running(),
            interfaces,
            profiles,
            impairments,
            pool: self.pool.stats(),
            tcp: self.tcp.lock().unwrap().as_ref().map(|t| t.stats()),
        }
    }

    pub fn prometheus_text(&self) -> String {
        let registry = self.registry.lock().unwrap();
        let mut out = String::new();
        for (name, iface) in &registry.interfaces {
            out.push_str(&iface.stats().to_prometheus(name));
        }
        out
    }

    // ---- config snapshot/restore ----

    pub fn snapshot(&self) -> EngineSnapshot {
        let registry = self.registry.lock().unwrap();
        EngineSnapshot {
            interfaces: registry
                .interfaces
                .iter()
                .map(|(k, v)| (k.clone(), v.config()))
                .collect(),
            traffic_profiles: registry
                .profiles
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Replaces both registries with the snapshot's contents. Traffic is
    /// stopped first; interfaces that fail to open are reported.
    pub fn restore(&self, snapshot: EngineSnapshot) -> Result<()> {
        self.stop_traffic();
        {
            let mut registry = self.registry.lock().unwrap();
            registry.interfaces.clear();
            registry.profiles.clear();
        }
        for (_, cfg) in snapshot.interfaces {
            self.admit_interface(cfg)?;
        }
        for (_, profile) in snapshot.traffic_profiles {
            self.add_profile(profile)?;
        }
        info!("configuration restored");
        Ok(())
    }

    // ---- capabilities ----

    pub fn capabilities(&self) -> serde_json::Value {
        let acceleration = accel::probe();
        let interfaces: Vec<_> = self
            .list_interfaces()
            .into_iter()
            .map(|cfg| {
                let hw = self
                    .interface(&cfg.name)
                    .map(|i| i.hw_timestamps())
                    .unwrap_or(false);
                json!({
                    "name": cfg.name,
                    "interface_type": cfg.interface_type,
                    "hardware_timestamps": hw,
                    "nominal_rate_mbps": cfg.nominal_rate_mbps(),
                })
            })
            .collect();
        json!({
            "acceleration": acceleration,
            "acceleration_available": acceleration.available(),
            "interfaces": interfaces,
            "features": {
                "traffic": true,
                "impairments": true,
                "rfc2544": true,
                "bgp": true,
                "netflow": true,
                "tcp": true,
                "qos": false,
                "snmp": false,
            },
        })
    }

    // ---- TCP engine ----

    /// Brings up the stateful TCP engine on `src_interface`, wiring its
    /// ingest handler and returning the shared engine.
    pub fn start_tcp(&self, src_interface: &str, dst_mac: MacAddr) -> Result<Arc<TcpEngine>> {
        let iface = self.interface(src_interface)?;
        let src_mac = iface.config().mac_address;
        let tx = Arc::new(L2SegmentTx::new(Arc::clone(&iface), src_mac, dst_mac));
        let engine = TcpEngine::new(self.opts.tcp.clone(), tx);
        let ingest_engine = Arc::clone(&engine);
        let ingest = spawn_ingest(iface, move |frame| ingest_engine.handle_frame(frame));
        self.tcp_ingest.lock().unwrap().push(ingest);
        *self.tcp.lock().unwrap() = Some(Arc::clone(&engine));
        Ok(engine)
    }

    pub fn tcp_engine(&self) -> Option<Arc<TcpEngine>> {
        self.tcp.lock().unwrap().clone()
    }

    // ---- RFC 2544 ----

    /// Launches the selected tests for `profile` in the background; results
    /// land in the report store keyed by profile name.
    pub fn start_rfc2544(
        self: &Arc<Self>,
        profile_name: &str,
        kinds: Vec<TestKind>,
        opts: Option<HarnessOptions>,
    ) -> Result<()> {
        let profile = self.profile(profile_name)?;
        let src = self.interface(&profile.src_interface)?;
        let dst = self.interface(&profile.dst_interface)?;
        let nominal = f64::from(src.config().nominal_rate_mbps());

        let cancel = Arc::new(AtomicBool::new(false));
        *self.rfc_cancel.lock().unwrap() = Some(Arc::clone(&cancel));

        let link = Arc::new(InterfaceTrialLink {
            src_cfg: src.config(),
            dst_cfg: dst.config(),
            src,
            dst,
            pool: Arc::clone(&self.pool),
            profile: profile.clone(),
        });
        let harness = match opts {
            Some(opts) => Rfc2544Harness::new(link, nominal, cancel).with_options(opts),
            None => Rfc2544Harness::new(link, nominal, cancel),
        };
        let engine = Arc::clone(self);
        let name = profile_name.to_string();
        self.tasks.spawn_blocking(move || {
            info!(profile = %name, ?kinds, "rfc2544 run started");
            let report = harness.run(&name, &kinds);
            engine.rfc_results.lock().unwrap().insert(name.clone(), report);
            info!(profile = %name, "rfc2544 run finished");
        });
        Ok(())
    }

    pub fn rfc2544_results(&self, profile: &str) -> Option<Rfc2544Report> {
        self.rfc_results.lock().unwrap().get(profile).cloned()
    }

    pub fn cancel_rfc2544(&self) {
        if let Some(cancel) = self.rfc_cancel.lock().unwrap().take() {
            cancel.store(true, Ordering::Relaxed);
        }
    }

    // ---- BGP ----

    pub async fn start_bgp(&self, cfg: BgpConfig) -> Result<BgpCountersSnapshot> {
        let mut slot = self.bgp.lock().await;
        if slot.is_some() {
            return Err(EngineError::Config("bgp session already running".into()));
        }
        let session = BgpSession::connect(cfg).await?;
        session.open().await?;
        let counters = session.counters();
        *slot = Some(session);
        Ok(counters)
    }

    pub async fn bgp_advertise(&self, routes: &[Route]) -> Result<usize> {
        let slot = self.bgp.lock().await;
        let session = slot
            .as_ref()
            .ok_or_else(|| EngineError::Config("no bgp session".into()))?;
        session.advertise(routes).await
    }

    pub async fn bgp_withdraw(&self, routes: &[Route]) -> Result<()> {
        let slot = self.bgp.lock().await;
        let session = slot
            .as_ref()
            .ok_or_else(|| EngineError::Config("no bgp session".into()))?;
        session.withdraw(routes).await
    }

    pub async fn stop_bgp(&self) -> Result<()> {
        let mut slot = self.bgp.lock().await;
        match slot.take() {
            Some(session) => session.close().await,
            None => Err(EngineError::Config("no bgp session".into())),
        }
    }

    pub async fn bgp_counters(&self) -> Option<BgpCountersSnapshot> {
        self.bgp.lock().await.as_ref().map(|s| s.counters())
    }

    // ---- NetFlow ----

    pub fn start_netflow(&self, cfg: NetflowConfig) -> Result<()> {
        let mut slot = self.netflow.lock().unwrap();
        if slot.is_some() {
            return Err(EngineError::Config("netflow generation already running".into()));
        }
        *slot = Some(spawn_generator(cfg));
        Ok(())
    }

    pub fn stop_netflow(&self) -> Result<()> {
        match self.netflow.lock().unwrap().take() {
            Some(handle) => {
                handle.stop();
                Ok(())
            }
            None => Err(EngineError::Config("netflow generation not running".into())),
        }
    }

    // ---- teardown ----

    pub async fn shutdown(&self) {
        self.stop_traffic();
        self.cancel_rfc2544();
        if let Some(handle) = self.netflow.lock().unwrap().take() {
            handle.stop();
        }
        let ingest: Vec<IngestHandle> = self.tcp_ingest.lock().unwrap().drain(..).collect();
        for handle in ingest {
            handle.stop();
        }
        let session = self.bgp.lock().await.take();
        if let Some(session) = session {
            let _ = session.close().await;
        }
        self.tasks.close();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.tasks.wait()).await;
        info!("engine shut down");
    }
}
