//! Periodic send-window inspection and self-healing.
//!
//! Each tick snapshots the session's in-flight window, liberates slots that
//! exceeded the response threshold, and keeps a short history of how
//! saturated those inspections were. A sustained run of critical
//! inspections triggers a session rebind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionManager};
use crate::stats::LatencyStats;

/// Tuning for one monitor task.
#[derive(Debug, Clone)]
pub struct WindowMonitorConfig {
    /// A slot pending longer than this is liberated.
    pub threshold: Duration,
    /// Delay before the first inspection.
    pub initial_delay: Duration,
    /// Time between inspections.
    pub period: Duration,
    /// Fraction of the window that must be liberated in one inspection for
    /// it to count as critical.
    pub saturation_threshold: f64,
    /// Inspections remembered by the circular history.
    pub history_len: usize,
    /// Critical inspections within the history that trigger a rebind.
    pub min_critical_occurrences: usize,
}

impl Default for WindowMonitorConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(30),
            initial_delay: Duration::from_secs(15),
            period: Duration::from_secs(30),
            saturation_threshold: 0.5,
            history_len: 10,
            min_critical_occurrences: 5,
        }
    }
}

/// Circular history of critical inspections with an incremental true-count.
#[derive(Debug)]
pub struct DegradationTracker {
    history: Vec<bool>,
    total_critical: usize,
    index: usize,
    min_critical: usize,
}

impl DegradationTracker {
    pub fn new(history_len: usize, min_critical: usize) -> Self {
        Self {
            history: vec![false; history_len.max(1)],
            total_critical: 0,
            index: 0,
            min_critical: min_critical.max(1),
        }
    }

    /// Record one inspection; returns true when the persistent-degradation
    /// condition is met.
    pub fn record(&mut self, critical: bool) -> bool {
        let evicted = self.history[self.index];
        if critical && !evicted {
            self.total_critical += 1;
        }
        if !critical && evicted {
            self.total_critical -= 1;
        }
        self.history[self.index] = critical;
        self.index = (self.index + 1) % self.history.len();

        debug!(
            criticas = self.total_critical,
            ventana = self.history.len(),
            "historial de inspecciones críticas actualizado"
        );

        self.total_critical >= self.min_critical
    }

    /// Forget everything, e.g. right after a rebind fired.
    pub fn reset(&mut self) {
        self.history.fill(false);
        self.total_critical = 0;
        self.index = 0;
    }

    pub fn total_critical(&self) -> usize {
        self.total_critical
    }
}

/// Monitor task body; runs until cancelled through `cancel`.
pub(crate) async fn run(
    manager: Arc<SessionManager>,
    stats: Arc<LatencyStats>,
    config: WindowMonitorConfig,
    mut cancel: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + config.initial_delay, config.period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut tracker =
        DegradationTracker::new(config.history_len, config.min_critical_occurrences);

    info!(
        umbral_ms = config.threshold.as_millis() as u64,
        periodo_ms = config.period.as_millis() as u64,
        "monitor de ventana iniciado"
    );

    loop {
        tokio::select! {
            biased;

            _ = cancel.changed() => {
                if *cancel.borrow_and_update() {
                    info!("monitor de ventana detenido");
                    break;
                }
            }

            _ = interval.tick() => {
                let Some(session) = manager.current_session() else {
                    warn!("sesión o ventana nula, no se puede inspeccionar");
                    continue;
                };

                let liberated = inspect_and_clean(&session, config.threshold, &stats);
                let critical =
                    liberated as f64 >= session.window().max_size() as f64 * config.saturation_threshold;

                if tracker.record(critical) {
                    warn!("degradación persistente de la ventana, ejecutando rebind");
                    manager.rebind().await;
                    tracker.reset();
                }
            }
        }
    }
}

/// One inspection pass: cancel every slot pending beyond `threshold` and
/// account the elapsed time as a timeout. Returns how many slots were
/// liberated.
fn inspect_and_clean(session: &Session, threshold: Duration, stats: &LatencyStats) -> usize {
    let snapshot = session.window().snapshot();
    let occupied = snapshot.len();
    let mut liberated = 0usize;

    for slot in snapshot {
        let elapsed = slot.offered_at.elapsed();
        if elapsed <= threshold {
            continue;
        }

        match session.window().cancel(slot.sequence) {
            Some(pending_for) => {
                liberated += 1;
                warn!(
                    sequence = slot.sequence,
                    elapsed_ms = pending_for.as_millis() as u64,
                    "slot sin respuesta liberado manualmente"
                );
            }
            None => {
                warn!(
                    sequence = slot.sequence,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slot colgado no pudo ser liberado"
                );
            }
        }
        stats.record_timeout(elapsed.as_millis() as u64);
    }

    info!(
        ocupados = occupied,
        liberados = liberated,
        umbral_ms = threshold.as_millis() as u64,
        "inspección de ventana completada"
    );

    liberated
}
