//! Drives the two periodic cycles against the shared guard.
//!
//! * health cycle (default every 30s): snapshot -> pool -> congestion
//! * security cycle (default every 10s): detectors -> reputation -> cleanup
//!
//! A failed or panicking iteration is logged and retried after a shorter
//! backoff; the loops only end on the shutdown signal, which also cuts any
//! pending sleep short.

use crate::config;
use crate::error::{GuardError, Result};
use crate::guard::{Guard, GuardHandle};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
struct Cadence {
    period: Duration,
    backoff: Duration,
}

/// Spawn both cycles. Each subscribes to `shutdown` before returning, so a
/// signal sent right after this call is not missed.
pub fn spawn(guard: GuardHandle, cfg: &config::Schedule, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_health_loop(guard.clone(), cfg, shutdown.subscribe()),
        spawn_security_loop(guard, cfg, shutdown.subscribe()),
    ]
}

pub fn spawn_health_loop(guard: GuardHandle, cfg: &config::Schedule, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
    let cadence = Cadence {
        period: Duration::from_secs(cfg.health_interval_secs),
        backoff: Duration::from_secs(cfg.health_error_backoff_secs),
    };
    tokio::spawn(run_loop("health", cadence, guard, shutdown_rx, |g, now| {
        g.health_cycle(now).map(|_| ())
    }))
}

pub fn spawn_security_loop(guard: GuardHandle, cfg: &config::Schedule, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
    let cadence = Cadence {
        period: Duration::from_secs(cfg.security_interval_secs),
        backoff: Duration::from_secs(cfg.security_error_backoff_secs),
    };
    tokio::spawn(run_loop("security", cadence, guard, shutdown_rx, |g, now| {
        g.security_cycle(now);
        Ok(())
    }))
}

async fn run_loop<F>(
    cycle: &'static str,
    cadence: Cadence,
    guard: GuardHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
    body: F,
) where
    F: Fn(&Guard, SystemTime) -> Result<()> + Send + 'static,
{
    info!(cycle, period_secs = cadence.period.as_secs(), "cycle started");
    loop {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&guard, SystemTime::now())))
            .unwrap_or_else(|payload| {
                Err(GuardError::CyclePanicked { cycle, message: panic_message(payload.as_ref()) })
            });
        let delay = match outcome {
            Ok(()) => cadence.period,
            Err(e) => {
                warn!(cycle, error = %e, backoff_secs = cadence.backoff.as_secs(), "cycle failed, backing off");
                if let Some(m) = guard.metrics() {
                    m.observe_failure(cycle);
                }
                cadence.backoff
            }
        };
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(cycle, "cycle received shutdown signal");
                break;
            }
            _ = time::sleep(delay) => {}
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
