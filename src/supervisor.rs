//! Process bootstrap: one session, sender and polling loop per configured
//! service, plus the shutdown hook that tears them all down.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::sender::Sender;
use crate::service::ServiceLoop;
use crate::session::SessionManager;
use crate::stats::LatencyStats;
use crate::store::{PgMessageStore, SharedStore};

struct ServiceRuntime {
    name: String,
    sender: Arc<Sender>,
    manager: Arc<SessionManager>,
    handle: JoinHandle<()>,
}

/// Owns every per-service runtime for the life of the process.
pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind every service, run the polling loops, and block until a
    /// shutdown signal drains everything. Initial bind failure is fatal.
    pub async fn run(self) -> Result<()> {
        let (running_tx, running_rx) = watch::channel(true);

        let base_store = PgMessageStore::connect(&self.config.datasource)
            .context("failed to build database pool")?;

        let mut services = Vec::with_capacity(self.config.services().len());
        for service_config in self.config.services() {
            let name = service_config.nombre.clone();
            let store: SharedStore = Arc::new(
                base_store.with_max_attempts(service_config.maximo_intentos),
            );
            let stats = Arc::new(LatencyStats::new(LatencyStats::DEFAULT_REPORT_EVERY));
            let manager = SessionManager::new(running_rx.clone());

            manager
                .bind(&name, store.clone(), &service_config.smpp, stats.clone())
                .await
                .with_context(|| format!("initial bind failed for service '{name}'"))?;

            let sender = Sender::new(
                name.clone(),
                manager.provider(),
                store.clone(),
                stats,
            );

            let service_loop = ServiceLoop::new(
                service_config.clone(),
                store,
                Arc::clone(&sender),
                running_rx.clone(),
            );
            let handle = tokio::spawn(service_loop.run());

            info!(service = %name, "servicio iniciado");
            services.push(ServiceRuntime {
                name,
                sender,
                manager,
                handle,
            });
        }

        info!(servicios = services.len(), "supervisor en marcha");

        shutdown_signal().await;
        info!("señal de apagado recibida");

        // Flip the running flag exactly once; every loop observes it at the
        // top of its next iteration or mid-sleep.
        let _ = running_tx.send(false);

        for service in &services {
            service.sender.shutdown().await;
            service.manager.shutdown(true).await;
        }

        for service in services {
            if let Err(e) = service.handle.await {
                if !e.is_cancelled() {
                    error!(service = %service.name, error = %e, "bucle de servicio terminó con pánico");
                }
            }
        }

        base_store.pool().close().await;
        info!("apagado completo");
        Ok(())
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "no se pudo instalar el manejador de SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
