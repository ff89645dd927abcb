//! Per-service polling loop: claim a batch, dispatch it, sleep, repeat.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, info_span, Instrument};

use crate::config::SmsServiceConfig;
use crate::sender::Sender;
use crate::store::SharedStore;

/// Drains the queue for one configured carrier service until the global
/// running flag flips.
pub struct ServiceLoop {
    config: SmsServiceConfig,
    store: SharedStore,
    sender: Arc<Sender>,
    running: watch::Receiver<bool>,
}

impl ServiceLoop {
    pub fn new(
        config: SmsServiceConfig,
        store: SharedStore,
        sender: Arc<Sender>,
        running: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            sender,
            running,
        }
    }

    pub async fn run(mut self) {
        let service = self.config.nombre.clone();
        let interval_ms = self.config.intervalo_entre_lotes_ms;

        info!(
            service = %service,
            modo = self.config.modo_envio_lote.as_str(),
            intervalo_ms = interval_ms,
            "bucle de servicio iniciado"
        );

        let mut count: u32 = 1;
        while *self.running.borrow_and_update() {
            self.process_batch(&service, count)
                .instrument(info_span!("lote", service = %service, contador = count))
                .await;

            if !self.sleep_between_batches(interval_ms).await {
                break;
            }

            count += 1;
            if count >= 100 {
                count = 1;
            }
        }

        info!(service = %service, "bucle de servicio finalizado");
    }

    /// One iteration: load the pending batch and hand it to the sender.
    /// Storage failures surface as an empty batch, so the loop always
    /// reaches its sleep.
    async fn process_batch(&self, service: &str, count: u32) {
        let messages = self
            .store
            .load_pending_messages(
                &self.config.smpp.source_address,
                self.config.telefonia.as_deref(),
                self.config.clasificacion.as_deref(),
                self.config.cantidad_maxima_por_lote,
            )
            .await;

        if messages.is_empty() {
            info!(
                service = %service,
                contador = count,
                "no se encontraron mensajes pendientes para enviar"
            );
            return;
        }

        self.sender
            .send(
                self.config.modo_envio_lote,
                messages,
                self.config.smpp.send_delay_ms,
            )
            .await;
    }

    /// Sleep the inter-batch interval; returns false when shutdown arrived
    /// mid-sleep.
    async fn sleep_between_batches(&mut self, interval_ms: u64) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => true,
            changed = self.running.changed() => match changed {
                Ok(()) => *self.running.borrow(),
                Err(_) => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SendMode;
    use crate::config::SmppConfig;
    use crate::session::SessionProvider;
    use crate::stats::LatencyStats;
    use crate::store::MemoryMessageStore;

    fn service_config(interval_ms: u64) -> SmsServiceConfig {
        SmsServiceConfig {
            nombre: "prueba".into(),
            telefonia: None,
            clasificacion: None,
            cantidad_maxima_por_lote: 100,
            modo_envio_lote: SendMode::SecuencialEspaciado,
            intervalo_entre_lotes_ms: interval_ms,
            maximo_intentos: 5,
            smpp: SmppConfig {
                host: "localhost".into(),
                port: 2775,
                system_id: "risk".into(),
                password: "secret".into(),
                source_address: "RISK".into(),
                send_delay_ms: 1,
            },
        }
    }

    fn harness(interval_ms: u64) -> (ServiceLoop, Arc<MemoryMessageStore>, watch::Sender<bool>) {
        let store = Arc::new(MemoryMessageStore::new(5));
        let provider: SessionProvider = Arc::new(|| None);
        let sender = Sender::new(
            "prueba",
            provider,
            store.clone(),
            Arc::new(LatencyStats::new(1000)),
        );
        let (tx, rx) = watch::channel(true);
        let service = ServiceLoop::new(service_config(interval_ms), store.clone(), sender, rx);
        (service, store, tx)
    }

    #[tokio::test]
    async fn loop_exits_when_running_flips() {
        let (service, _store, tx) = harness(10_000);
        let handle = tokio::spawn(service.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(false).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn empty_batch_skips_dispatch_and_keeps_looping() {
        let (service, _store, tx) = harness(5);
        let handle = tokio::spawn(service.run());

        // A few intervals pass without anything to send.
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(false).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn batch_is_dispatched_against_the_store() {
        let (service, store, tx) = harness(5);
        store.insert_pending(1, "0972100000", "Hola");

        let handle = tokio::spawn(service.run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(false).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        // With no session bound, the sender settled the row with the
        // synthetic session-unavailable code.
        let row = store.row(1).unwrap();
        assert_eq!(row.response_code, Some(999_998));
    }
}
