//! Ownership of one carrier session and its monitor.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SmppConfig;
use crate::session::monitor::{self, WindowMonitorConfig};
use crate::session::{InboundHandler, Session, SessionConfig, SessionError};
use crate::stats::LatencyStats;
use crate::store::SharedStore;

/// Read-only getter for the currently bound session. The sender calls it on
/// every submit so a rebind atomically swaps the target underneath it.
pub type SessionProvider = Arc<dyn Fn() -> Option<Arc<Session>> + Send + Sync>;

/// Send-window size negotiated for every session.
const DEFAULT_WINDOW_SIZE: usize = 50;

/// Maximum rebind attempts per invocation.
const REBIND_ATTEMPTS: u32 = 5;

/// Pause between shutdown and bind within one rebind attempt.
const REBIND_SETTLE: Duration = Duration::from_secs(15);

/// Pause between failed rebind attempts.
const REBIND_BACKOFF: Duration = Duration::from_secs(2);

/// Wait granted to the provider's unbind_resp during shutdown.
const UNBIND_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct BindParams {
    service: String,
    store: SharedStore,
    smpp: SmppConfig,
    stats: Arc<LatencyStats>,
}

struct MonitorHandle {
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

/// Owns at most one bound session and at most one monitor task at a time.
pub struct SessionManager {
    /// Self-reference handed to the monitor task and the provider closure.
    this: Weak<SessionManager>,
    session: RwLock<Option<Arc<Session>>>,
    monitor: Mutex<Option<MonitorHandle>>,
    bind_params: Mutex<Option<BindParams>>,
    rebind_lock: tokio::sync::Mutex<()>,
    monitor_config: WindowMonitorConfig,
    window_size: usize,
    /// Global running flag; flips to false exactly once at shutdown.
    running: watch::Receiver<bool>,
}

impl SessionManager {
    pub fn new(running: watch::Receiver<bool>) -> Arc<Self> {
        Self::with_config(running, WindowMonitorConfig::default(), DEFAULT_WINDOW_SIZE)
    }

    pub fn with_config(
        running: watch::Receiver<bool>,
        monitor_config: WindowMonitorConfig,
        window_size: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            session: RwLock::new(None),
            monitor: Mutex::new(None),
            bind_params: Mutex::new(None),
            rebind_lock: tokio::sync::Mutex::new(()),
            monitor_config,
            window_size: window_size.max(1),
            running,
        })
    }

    /// Bind a transceiver session for `service`, memoizing the parameters
    /// for later rebinds, and start the window monitor.
    pub async fn bind(
        &self,
        service: &str,
        store: SharedStore,
        smpp: &SmppConfig,
        stats: Arc<LatencyStats>,
    ) -> Result<Arc<Session>, SessionError> {
        let params = BindParams {
            service: service.to_string(),
            store,
            smpp: smpp.clone(),
            stats,
        };
        *self.bind_params.lock().unwrap() = Some(params.clone());

        self.bind_inner(&params).await
    }

    async fn bind_inner(&self, params: &BindParams) -> Result<Arc<Session>, SessionError> {
        let config = SessionConfig::new(
            params.smpp.system_id.clone(),
            params.smpp.password.clone(),
            self.window_size,
        );

        info!(
            service = %params.service,
            session = %config.name,
            host = %params.smpp.host,
            port = params.smpp.port,
            "estableciendo sesión transceiver"
        );

        let handler = Arc::new(InboundHandler::new(&params.service, params.store.clone()));
        let session = Arc::new(
            Session::connect(&params.smpp.host, params.smpp.port, config, handler).await?,
        );

        *self.session.write().unwrap() = Some(Arc::clone(&session));
        self.start_monitor(Arc::clone(&params.stats));

        Ok(session)
    }

    fn start_monitor(&self, stats: Arc<LatencyStats>) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        let mut guard = self.monitor.lock().unwrap();

        // At most one active monitor task per manager; a leftover task is
        // signalled, never joined, so a monitor-initiated rebind can pass
        // through here without deadlocking on itself.
        if let Some(previous) = guard.take() {
            let _ = previous.cancel.send(true);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor::run(
            manager,
            stats,
            self.monitor_config.clone(),
            cancel_rx,
        ));

        *guard = Some(MonitorHandle {
            handle,
            cancel: cancel_tx,
        });
    }

    /// Currently bound session, if any.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.session.read().unwrap().clone()
    }

    /// Provider closure handed to the sender.
    pub fn provider(&self) -> SessionProvider {
        let manager = self.this.clone();
        Arc::new(move || manager.upgrade().and_then(|m| m.current_session()))
    }

    /// Stop the monitor, unbind and destroy the session. Every step is
    /// guarded so a failure in one never prevents the next.
    pub async fn shutdown(&self, force: bool) {
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            if force {
                monitor.handle.abort();
            } else {
                let _ = monitor.cancel.send(true);
            }
        }

        let session = self.session.write().unwrap().take();
        if let Some(session) = session {
            if session.is_bound() {
                if let Err(e) = session.unbind(UNBIND_WAIT).await {
                    warn!(session = %session.name(), error = %e, "unbind falló durante el apagado");
                }
            }
            session.destroy();
        }
    }

    /// Tear the session down and bind again with the memoized parameters.
    ///
    /// Serialized against concurrent invocations; never returns an error to
    /// the caller (the monitor). Interruption by process shutdown skips to
    /// the next attempt, except on the last one, which proceeds to bind
    /// regardless.
    pub async fn rebind(&self) {
        let _serialized = self.rebind_lock.lock().await;

        let params = self.bind_params.lock().unwrap().clone();
        let Some(params) = params else {
            warn!("rebind invocado sin parámetros de bind memorizados");
            return;
        };

        for attempt in 1..=REBIND_ATTEMPTS {
            self.shutdown(false).await;

            let interrupted = self.sleep_interruptible(REBIND_SETTLE).await;
            if interrupted && attempt < REBIND_ATTEMPTS {
                warn!(
                    service = %params.service,
                    attempt,
                    "espera de rebind interrumpida, pasando al siguiente intento"
                );
                continue;
            }

            match self.bind_inner(&params).await {
                Ok(_) => {
                    info!(service = %params.service, attempt, "rebind exitoso");
                    return;
                }
                Err(e) => {
                    error!(
                        service = %params.service,
                        attempt,
                        error = %e,
                        "intento de rebind fallido"
                    );
                    if attempt < REBIND_ATTEMPTS {
                        self.sleep_interruptible(REBIND_BACKOFF).await;
                    }
                }
            }
        }

        error!(
            service = %params.service,
            attempts = REBIND_ATTEMPTS,
            "rebind agotado; el monitor seguirá vigilando la ventana"
        );

        // The monitor outlives a failed rebind so a later recovery can still
        // be detected and retried.
        if *self.running.borrow() {
            self.start_monitor(Arc::clone(&params.stats));
        }
    }

    /// Sleep for `duration`, waking early if the process starts shutting
    /// down. Returns true when interrupted.
    async fn sleep_interruptible(&self, duration: Duration) -> bool {
        let mut running = self.running.clone();
        if !*running.borrow_and_update() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = running.changed() => match changed {
                Ok(()) => !*running.borrow(),
                Err(_) => true,
            },
        }
    }
}
