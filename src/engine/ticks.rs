//! Tick loops: the scheduler half of the engine.
//!
//! Both loops share the same shape: a `tokio::time::interval` with
//! `MissedTickBehavior::Skip` raced against the shutdown watch channel.
//! The tick body is awaited inline, so a slow pass can never overlap
//! the next one — missed ticks are dropped, never queued. The interval
//! fires immediately on startup, which is what makes crash recovery
//! kick in right after a restart.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::{lifecycle, reconcile, EngineCtx};
use crate::types::OrderStatus;

pub(crate) async fn engine_loop(ctx: Arc<EngineCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(ctx.cfg.engine_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => run_engine_tick(&ctx).await,
        }
    }
    debug!("engine loop stopped");
}

pub(crate) async fn reconcile_loop(ctx: Arc<EngineCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(ctx.cfg.reconcile_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => reconcile::run_sweep(&ctx).await,
        }
    }
    debug!("reconcile loop stopped");
}

/// One lifecycle pass: fan every PENDING/EXECUTED order out to the
/// bounded worker pool and wait for all of them. Orders sitting in
/// IN_EXECUTION belong to someone else (or to the stale sweep).
pub(crate) async fn run_engine_tick(ctx: &Arc<EngineCtx>) {
    let orders = match ctx.repo.list_non_terminal().await {
        Ok(orders) => orders,
        Err(err) => {
            warn!("tick skipped, repository unavailable: {err}");
            return;
        }
    };

    let workers = Arc::new(Semaphore::new(ctx.cfg.worker_limit));
    let mut pool = JoinSet::new();
    let mut scheduled = 0usize;
    for order in orders {
        if order.status == OrderStatus::InExecution {
            continue;
        }
        scheduled += 1;
        let ctx = ctx.clone();
        let workers = workers.clone();
        pool.spawn(async move {
            let _permit = workers.acquire_owned().await.expect("worker pool closed");
            lifecycle::process_order(&ctx, order).await;
        });
    }
    while let Some(joined) = pool.join_next().await {
        if let Err(err) = joined {
            warn!("order worker panicked: {err}");
        }
    }
    if scheduled > 0 {
        debug!(orders = scheduled, "engine tick complete");
    }
}
