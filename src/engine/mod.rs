//! The trade lifecycle engine.
//!
//! A per-order state machine driven by two periodic loops: the fast
//! tick walks every non-terminal order through entry triggers, order
//! placement and exit checks; the slow tick reconciles stored state
//! against the exchange (crashed workers, externally cancelled TPs,
//! manual sells). Workers coordinate purely through the repository's
//! compare-and-swap on the status column — no in-memory locks are held
//! across network I/O.

pub mod clock;
pub mod notify;
pub mod triggers;

mod lifecycle;
mod ops;
mod reconcile;
mod ticks;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use clock::{Clock, ManualClock, SystemClock};
pub use notify::{transition_message, LogSink, NotificationSink};
pub use triggers::{entry_decision, stop_decision, EntryDecision, StopDecision};

use crate::exchange::{AdapterRegistry, FilterCache};
use crate::store::OrderRepository;
use crate::EngineConfig;

// ─────────────────────────────────────────────────────────
// Shared context
// ─────────────────────────────────────────────────────────

/// Everything the tick workers and user operations share. Cheap to pass
/// behind an `Arc`; all interior state is its own lock.
pub(crate) struct EngineCtx {
    pub(crate) cfg: EngineConfig,
    pub(crate) repo: OrderRepository,
    pub(crate) registry: Arc<AdapterRegistry>,
    pub(crate) filters: Arc<FilterCache>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    /// Consecutive filter-violation strikes per order. In-memory by
    /// design: losing the count on restart only grants one extra retry.
    pub(crate) filter_strikes: Mutex<HashMap<i64, u32>>,
    /// Last insufficient-balance notification per user, for the 24 h
    /// cooldown.
    pub(crate) balance_notified: Mutex<HashMap<i64, DateTime<Utc>>>,
}

// ─────────────────────────────────────────────────────────
// Facade
// ─────────────────────────────────────────────────────────

/// Library entry point for the hosting application: lifecycle control
/// plus the order operations in [`ops`](self).
pub struct Engine {
    ctx: Arc<EngineCtx>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        repo: OrderRepository,
        registry: Arc<AdapterRegistry>,
        filters: Arc<FilterCache>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(EngineCtx {
                cfg,
                repo,
                registry,
                filters,
                clock,
                sink,
                filter_strikes: Mutex::new(HashMap::new()),
                balance_notified: Mutex::new(HashMap::new()),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the fast (lifecycle) and slow (reconciliation) loops. Both
    /// fire once immediately, so crash recovery starts right away.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("engine already started");
            return;
        }
        info!(
            engine_tick = ?self.ctx.cfg.engine_tick,
            reconcile_tick = ?self.ctx.cfg.reconcile_tick,
            workers = self.ctx.cfg.worker_limit,
            "🚀 engine starting"
        );
        tasks.push(tokio::spawn(ticks::engine_loop(
            self.ctx.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(ticks::reconcile_loop(
            self.ctx.clone(),
            self.shutdown.subscribe(),
        )));
    }

    /// Stop scheduling ticks and wait for in-flight workers. Orders left
    /// IN_EXECUTION by a hard kill are recovered by the stale sweep on
    /// next start.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                warn!("tick loop join failed: {err}");
            }
        }
        info!("🛑 engine stopped");
    }

    /// The adapter registry, so the hosting application can invalidate
    /// cached clients when a user rotates credentials.
    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.ctx.registry
    }

    /// Run one lifecycle pass over all non-terminal orders — exactly
    /// what the fast tick does. For hosts that drive their own
    /// scheduler, and for deterministic tests.
    pub async fn run_tick_once(&self) {
        ticks::run_engine_tick(&self.ctx).await;
    }

    /// Run one reconciliation sweep — exactly what the slow tick does.
    pub async fn run_reconcile_once(&self) {
        reconcile::run_sweep(&self.ctx).await;
    }
}
