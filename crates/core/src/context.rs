//! Single construction point for every shared component (spec §9: "avoid
//! ad-hoc access; all components receive [shared state] via a context
//! passed at construction"). Built once at process start by the
//! orchestrator binary, shut down in reverse order.

use crate::autoscaler::AutoScaler;
use crate::breaker::CircuitBreaker;
use crate::collector::Collector;
use crate::config::CoreConfig;
use crate::events::EventHandlers;
use crate::health::HealthMonitor;
use crate::multiplex::Multiplexer;
use crate::ports::PortAllocator;
use crate::provisioner::Provisioner;
use crate::reconciler::Reconciler;
use crate::runtime::Runtime;
use crate::selector::EngineSelector;
use crate::state::{InMemoryStatsStore, StateStore, StatsStore};
use crate::vpn::VpnSupervisor;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;

/// Every shared singleton the control plane needs, constructed once.
pub struct Context {
    pub config: CoreConfig,
    pub runtime: Arc<dyn Runtime>,
    pub state: Arc<StateStore>,
    pub ports: Arc<PortAllocator>,
    pub breaker: Arc<CircuitBreaker>,
    pub vpn: Arc<VpnSupervisor>,
    pub health: Arc<HealthMonitor>,
    pub selector: Arc<EngineSelector>,
    pub provisioner: Arc<Provisioner>,
    pub multiplexer: Arc<Multiplexer>,
    pub events: Arc<EventHandlers>,
    pub collector: Arc<Collector>,
    pub reconciler: Arc<Reconciler>,
    pub autoscaler: Arc<AutoScaler>,
    first_reconcile_done: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Context {
    pub fn new(config: CoreConfig, runtime: Arc<dyn Runtime>, image: String) -> Arc<Self> {
        Self::with_stats_store(config, runtime, image, Arc::new(InMemoryStatsStore::default()))
    }

    pub fn with_stats_store(
        config: CoreConfig,
        runtime: Arc<dyn Runtime>,
        image: String,
        stats_store: Arc<dyn StatsStore>,
    ) -> Arc<Self> {
        let state = Arc::new(StateStore::new(stats_store));
        let ports = Arc::new(PortAllocator::new(&config.ports));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let vpn = VpnSupervisor::new(runtime.clone(), state.clone(), config.vpn.clone());
        let health = HealthMonitor::new(state.clone(), config.health.clone());
        let selector = Arc::new(EngineSelector::new(state.clone(), vpn.clone(), &config.autoscaler));
        let provisioner = Arc::new(Provisioner::new(
            runtime.clone(),
            state.clone(),
            ports.clone(),
            breaker.clone(),
            &config.autoscaler,
        ));
        let multiplexer = Multiplexer::new(state.clone(), selector.clone(), config.multiplexer.clone());
        let events = Arc::new(EventHandlers::new(state.clone(), selector.clone(), multiplexer.clone(), provisioner.clone()));
        let collector = Collector::new(state.clone(), events.clone(), config.collector.clone());
        let first_reconcile_done = Arc::new(AtomicBool::new(false));
        let reconciler = Reconciler::new(
            runtime.clone(),
            state.clone(),
            ports.clone(),
            config.reconciler.clone(),
            config.vpn.container_names.clone(),
            first_reconcile_done.clone(),
        );
        let autoscaler = AutoScaler::new(
            state.clone(),
            vpn.clone(),
            health.clone(),
            breaker.clone(),
            provisioner.clone(),
            config.autoscaler.clone(),
            image,
            first_reconcile_done.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            runtime,
            state,
            ports,
            breaker,
            vpn,
            health,
            selector,
            provisioner,
            multiplexer,
            events,
            collector,
            reconciler,
            autoscaler,
            first_reconcile_done,
            shutdown_tx,
        })
    }

    pub fn first_reconcile_done(&self) -> bool {
        self.first_reconcile_done.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Spawns every periodic loop. Call once, after construction.
    pub fn spawn_all(self: &Arc<Self>) {
        let shutdown = self.shutdown_tx.subscribe();
        self.vpn.spawn_all(shutdown.clone());
        self.health.spawn(shutdown.clone());
        self.reconciler.spawn(shutdown.clone());
        self.collector.spawn(shutdown.clone());
        self.multiplexer.spawn_idle_gc(shutdown.clone());
        self.autoscaler.spawn(shutdown, self.vpn.subscribe_port_changes());
    }

    /// Shutdown ordering (spec §5 / §9 design notes): stop every
    /// broadcaster first (so upstream sockets close cleanly), then signal
    /// the control loops, then the caller is free to drop the runtime
    /// adapter.
    pub async fn shutdown(&self) {
        self.multiplexer.stop_all();
        let _ = self.shutdown_tx.send(true);
    }
}
