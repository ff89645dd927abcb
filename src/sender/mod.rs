//! Outbound dispatch: four batch strategies over one bounded worker pool.

pub mod segment;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::model::{MessageStatus, SendMode, SmsMessage};
use crate::session::SessionProvider;
use crate::stats::LatencyStats;
use crate::store::SharedStore;
use crate::wire::{
    status_text, SubmitSm, ESM_CLASS_DEFAULT, ESM_CLASS_UDHI, NPI_ISDN, TON_INTERNATIONAL,
};

use segment::{reference_number, SegmentedMessage};

/// Worker tasks that may run submits concurrently.
const WORKER_POOL_SIZE: usize = 50;

/// Pacing applied when the configured delay is zero.
const DEFAULT_SEND_DELAY: Duration = Duration::from_millis(500);

/// Wall-clock budget for one submit, window admission included.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace period for in-flight sends at shutdown before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Synthetic response code: no bound session at send time.
const CODE_SESSION_UNAVAILABLE: i32 = 999_998;

/// Synthetic response code: submit raised an error instead of a status.
const CODE_EXCEPTION: i32 = 999_999;

/// Command statuses that keep a message in the queue for another attempt.
/// Reference: SMPP 3.4 error codes; -1 covers locally synthesized failures.
pub const RETRYABLE_STATUSES: [i32; 4] = [-1, 8, 20, 88];

/// Queue disposition for a non-OK carrier status.
pub fn disposition_for_status(status: i32) -> MessageStatus {
    if RETRYABLE_STATUSES.contains(&status) {
        MessageStatus::PendingSend
    } else {
        MessageStatus::ErrorProcessed
    }
}

/// Per-service sender over the session provider and the shared store.
pub struct Sender {
    /// Self-reference cloned into pacer and worker tasks.
    this: Weak<Sender>,
    service: String,
    session_provider: SessionProvider,
    store: SharedStore,
    stats: Arc<LatencyStats>,
    workers: Arc<Semaphore>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    accepting: AtomicBool,
}

impl Sender {
    pub fn new(
        service: impl Into<String>,
        session_provider: SessionProvider,
        store: SharedStore,
        stats: Arc<LatencyStats>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            service: service.into(),
            session_provider,
            store,
            stats,
            workers: Arc::new(Semaphore::new(WORKER_POOL_SIZE)),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            accepting: AtomicBool::new(true),
        })
    }

    /// Dispatch one batch with the selected strategy.
    ///
    /// `paralelo`, `paralelo_espaciado` and `secuencial_espaciado_async`
    /// return as soon as the work is scheduled; `secuencial_espaciado`
    /// returns once the whole batch has been processed. A non-positive
    /// delay falls back to 500 ms.
    pub async fn send(&self, mode: SendMode, messages: Vec<SmsMessage>, delay_ms: u64) {
        if !self.accepting.load(Ordering::SeqCst) {
            warn!(service = %self.service, "sender apagándose, lote rechazado");
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let delay = if delay_ms == 0 {
            DEFAULT_SEND_DELAY
        } else {
            Duration::from_millis(delay_ms)
        };

        info!(
            service = %self.service,
            modo = mode.as_str(),
            cantidad = messages.len(),
            "despachando lote"
        );

        match mode {
            SendMode::Paralelo => {
                for message in messages {
                    self.spawn_worker(message).await;
                }
            }

            SendMode::ParaleloEspaciado => {
                let span = Span::current();
                self.tasks.lock().await.spawn(
                    async move {
                        let mut ticker = tokio::time::interval(delay);
                        for message in messages {
                            ticker.tick().await;
                            this.send_single(&message).await;
                        }
                    }
                    .instrument(span),
                );
            }

            SendMode::SecuencialEspaciado => {
                for message in &messages {
                    self.send_single(message).await;
                    tokio::time::sleep(delay).await;
                }
            }

            SendMode::SecuencialEspaciadoAsync => {
                let span = Span::current();
                self.tasks.lock().await.spawn(
                    async move {
                        for message in &messages {
                            this.send_single(message).await;
                            tokio::time::sleep(delay).await;
                        }
                        info!(service = %this.service, "envío secuencial async completado");
                    }
                    .instrument(span),
                );
            }
        }
    }

    async fn spawn_worker(&self, message: SmsMessage) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let span = Span::current();
        self.tasks.lock().await.spawn(
            async move {
                this.send_single(&message).await;
            }
            .instrument(span),
        );
    }

    /// Send one message: encode, segment, submit each part, and settle the
    /// persistent outcome.
    pub async fn send_single(&self, message: &SmsMessage) {
        let span = info_span!("envío", id_mensaje = %message.id);
        self.send_single_inner(message).instrument(span).await;
    }

    async fn send_single_inner(&self, message: &SmsMessage) {
        let Ok(_permit) = self.workers.acquire().await else {
            warn!(service = %self.service, "pool de envío cerrado, mensaje rechazado");
            return;
        };

        info!(
            destino = %message.destination,
            texto = %message.text,
            "enviar mensaje"
        );

        let encoded = segment::encode_gsm7(&message.text);
        let segmented = segment::split_segments(encoded, reference_number());
        let total_parts = segmented.total_parts() as u8;

        let parts: Vec<(u8, SubmitSm)> = match segmented {
            SegmentedMessage::Single(body) => {
                vec![(1, self.build_submit(message, body, ESM_CLASS_DEFAULT))]
            }
            SegmentedMessage::Multi { parts, .. } => parts
                .into_iter()
                .map(|part| {
                    (
                        part.part_num,
                        self.build_submit(message, part.body, ESM_CLASS_UDHI),
                    )
                })
                .collect(),
        };

        for (part_num, pdu) in parts {
            let session = (self.session_provider)().filter(|s| s.is_bound());
            let Some(session) = session else {
                warn!(
                    destino = %message.destination,
                    parte = part_num,
                    "sesión SMPP no disponible o fuera de estado BOUND, no se puede enviar"
                );
                if part_num == 1 {
                    self.store
                        .update_message_status(
                            &message.id,
                            MessageStatus::PendingSend,
                            Some(CODE_SESSION_UNAVAILABLE),
                            Some("Sesión no disponible"),
                            None,
                        )
                        .await;
                }
                return;
            };

            let started = Instant::now();
            let result = session.submit(pdu, SUBMIT_TIMEOUT).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            self.stats.record(latency_ms);

            match result {
                Ok(outcome) => {
                    info!(
                        destino = %message.destination,
                        parte = part_num,
                        total = total_parts,
                        id_externo = %outcome.message_id,
                        status = outcome.command_status,
                        latencia_ms = latency_ms,
                        "respuesta de envío recibida"
                    );

                    let status_code = outcome.command_status as i32;
                    if outcome.is_ok() {
                        // Storage sees one logical message: only the terminal
                        // segment confirms full acceptance.
                        if part_num == total_parts {
                            self.store
                                .update_message_status(
                                    &message.id,
                                    MessageStatus::Sent,
                                    Some(status_code),
                                    Some(status_text(outcome.command_status)),
                                    Some(&outcome.message_id),
                                )
                                .await;
                        }
                    } else if part_num == 1 {
                        // Only the initial segment decides the retry
                        // disposition.
                        self.store
                            .update_message_status(
                                &message.id,
                                disposition_for_status(status_code),
                                Some(status_code),
                                Some(status_text(outcome.command_status)),
                                None,
                            )
                            .await;
                    }
                }
                Err(e) => {
                    error!(
                        destino = %message.destination,
                        parte = part_num,
                        error = %e,
                        "error al enviar mensaje"
                    );
                    self.store
                        .update_message_status(
                            &message.id,
                            MessageStatus::PendingSend,
                            Some(CODE_EXCEPTION),
                            Some(&format!("Excepción: {e}")),
                            None,
                        )
                        .await;
                    return;
                }
            }
        }
    }

    fn build_submit(&self, message: &SmsMessage, body: Vec<u8>, esm_class: u8) -> SubmitSm {
        SubmitSm {
            source_addr_ton: TON_INTERNATIONAL,
            source_addr_npi: NPI_ISDN,
            source_addr: message.source.clone(),
            dest_addr_ton: TON_INTERNATIONAL,
            dest_addr_npi: NPI_ISDN,
            dest_addr: message.destination.clone(),
            esm_class,
            short_message: body,
            ..Default::default()
        }
    }

    /// Stop accepting work, give in-flight sends a grace period, then abort
    /// whatever is left.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        service = %self.service,
                        pendientes = tasks.len(),
                        "gracia de apagado agotada, abortando envíos pendientes"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        self.workers.close();
        info!(service = %self.service, "sender detenido");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testutil::{bound_pair, NullHandler, Peer};
    use crate::session::Session;
    use crate::store::MemoryMessageStore;
    use crate::wire::{CommandId, Frame, Pdu, PduHeader, SubmitSmResp, STATUS_OK};
    use bigdecimal::BigDecimal;

    struct Fixture {
        sender: Arc<Sender>,
        store: Arc<MemoryMessageStore>,
        session: Arc<Session>,
    }

    async fn fixture() -> (Fixture, Peer) {
        let (session, peer) = bound_pair(10, Arc::new(NullHandler)).await;
        let session = Arc::new(session);
        let store = Arc::new(MemoryMessageStore::new(5));
        let provider: SessionProvider = {
            let session = Arc::clone(&session);
            Arc::new(move || Some(Arc::clone(&session)))
        };
        let sender = Sender::new(
            "tigo",
            provider,
            store.clone(),
            Arc::new(LatencyStats::new(1000)),
        );
        (
            Fixture {
                sender,
                store,
                session,
            },
            peer,
        )
    }

    fn message(id: i64, text: &str) -> SmsMessage {
        SmsMessage::new(BigDecimal::from(id), "RISK", "0972100000", text)
    }

    #[test]
    fn retry_set_is_exact() {
        for status in [-1, 8, 20, 88] {
            assert_eq!(disposition_for_status(status), MessageStatus::PendingSend);
        }
        for status in [1, 13, 69, 87, 89, 255] {
            assert_eq!(disposition_for_status(status), MessageStatus::ErrorProcessed);
        }
    }

    #[tokio::test]
    async fn single_segment_happy_path_marks_sent() {
        let (fx, mut peer) = fixture().await;
        fx.store.insert_pending(10, "0972100000", "Hola");

        let msg = message(10, "Hola");
        let send = fx.sender.send_single(&msg);
        let peer_side = async {
            let frame = peer.answer_submit(STATUS_OK, "ext-42").await;
            let Pdu::SubmitSm(pdu) = frame.pdu else { unreachable!() };
            pdu
        };
        let (_, pdu) = tokio::join!(send, peer_side);

        assert_eq!(pdu.esm_class, ESM_CLASS_DEFAULT);
        assert_eq!(pdu.data_coding, 0x00);
        assert_eq!(pdu.short_message, b"Hola");
        assert_eq!(pdu.source_addr_ton, TON_INTERNATIONAL);
        assert_eq!(pdu.dest_addr_npi, NPI_ISDN);

        let row = fx.store.row(10).unwrap();
        assert_eq!(row.state, "E");
        assert_eq!(row.attempts, 1);
        assert_eq!(row.external_id.as_deref(), Some("ext-42"));
        assert!(row.sent_at.is_some());
    }

    #[tokio::test]
    async fn retryable_status_returns_message_to_pending() {
        let (fx, mut peer) = fixture().await;
        fx.store.insert_pending(10, "0972100000", "Hola");

        let msg = message(10, "Hola");
        let send = fx.sender.send_single(&msg);
        let peer_side = peer.answer_submit(88, "");
        tokio::join!(send, peer_side);

        let row = fx.store.row(10).unwrap();
        assert_eq!(row.state, "P");
        assert_eq!(row.attempts, 1);
        assert_eq!(row.response_code, Some(88));
    }

    #[tokio::test]
    async fn terminal_status_marks_error_processed() {
        let (fx, mut peer) = fixture().await;
        fx.store.insert_pending(10, "0972100000", "Hola");

        let msg = message(10, "Hola");
        let send = fx.sender.send_single(&msg);
        let peer_side = peer.answer_submit(13, "");
        tokio::join!(send, peer_side);

        let row = fx.store.row(10).unwrap();
        assert_eq!(row.state, "R");
        assert_eq!(row.response_code, Some(13));
    }

    #[tokio::test]
    async fn two_segment_message_updates_only_on_the_last_part() {
        let (fx, mut peer) = fixture().await;
        fx.store.insert_pending(10, "0972100000", "long");
        let text = "A".repeat(200);

        let msg = message(10, &text);
        let send = fx.sender.send_single(&msg);
        let store = fx.store.clone();
        let peer_side = async move {
            let first = peer.expect().await;
            let Pdu::SubmitSm(ref pdu1) = first.pdu else { panic!() };
            assert_eq!(pdu1.esm_class, ESM_CLASS_UDHI);
            assert_eq!(&pdu1.short_message[..3], &[0x05, 0x00, 0x03]);
            assert_eq!(&pdu1.short_message[4..6], &[0x02, 0x01]);
            assert_eq!(pdu1.short_message.len(), 6 + 153);
            let ref_num = pdu1.short_message[3];
            peer.send(Frame::new(
                PduHeader::with_status(CommandId::SubmitSmResp, first.sequence(), STATUS_OK),
                Pdu::SubmitSmResp(SubmitSmResp { message_id: "ext-1".into() }),
            ))
            .await;

            // Between the parts the row must still be pending: only the
            // terminal segment settles it.
            tokio::task::yield_now().await;
            assert_eq!(store.row(10).unwrap().state, "P");
            assert_eq!(store.row(10).unwrap().attempts, 0);

            let second = peer.expect().await;
            let Pdu::SubmitSm(ref pdu2) = second.pdu else { panic!() };
            assert_eq!(&pdu2.short_message[..6], &[0x05, 0x00, 0x03, ref_num, 0x02, 0x02]);
            assert_eq!(pdu2.short_message.len(), 6 + 47);
            peer.send(Frame::new(
                PduHeader::with_status(CommandId::SubmitSmResp, second.sequence(), STATUS_OK),
                Pdu::SubmitSmResp(SubmitSmResp { message_id: "ext-2".into() }),
            ))
            .await;
        };
        tokio::join!(send, peer_side);

        let row = fx.store.row(10).unwrap();
        assert_eq!(row.state, "E");
        assert_eq!(row.attempts, 1);
        assert_eq!(row.external_id.as_deref(), Some("ext-2"));
    }

    #[tokio::test]
    async fn missing_session_sets_synthetic_code_without_submitting() {
        let store = Arc::new(MemoryMessageStore::new(5));
        store.insert_pending(10, "0972100000", "Hola");
        let provider: SessionProvider = Arc::new(|| None);
        let sender = Sender::new(
            "tigo",
            provider,
            store.clone(),
            Arc::new(LatencyStats::new(1000)),
        );

        sender.send_single(&message(10, "Hola")).await;

        let row = store.row(10).unwrap();
        assert_eq!(row.state, "P");
        assert_eq!(row.response_code, Some(999_998));
        assert_eq!(row.response_text.as_deref(), Some("Sesión no disponible"));
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    async fn unbound_session_counts_as_unavailable() {
        let (fx, peer) = fixture().await;
        fx.store.insert_pending(10, "0972100000", "Hola");

        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fx.session.is_bound());

        fx.sender.send_single(&message(10, "Hola")).await;
        assert_eq!(fx.store.row(10).unwrap().response_code, Some(999_998));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_timeout_is_an_exception_and_records_latency() {
        let (fx, mut peer) = fixture().await;
        fx.store.insert_pending(10, "0972100000", "Hola");

        // The peer swallows the submit; paused time fast-forwards the 3 s
        // in-call deadline.
        let silent = tokio::spawn(async move {
            let _ = peer.expect().await;
            peer
        });

        fx.sender.send_single(&message(10, "Hola")).await;

        let row = fx.store.row(10).unwrap();
        assert_eq!(row.state, "P");
        assert_eq!(row.response_code, Some(999_999));
        assert!(row.response_text.unwrap().starts_with("Excepción: "));
        assert_eq!(fx.sender.stats.total_count(), 1);

        silent.await.unwrap();
    }

    #[tokio::test]
    async fn sequential_mode_preserves_batch_order() {
        let (fx, mut peer) = fixture().await;
        fx.store.insert_pending(1, "0972100000", "uno");
        fx.store.insert_pending(2, "0972100000", "dos");

        let batch = vec![message(1, "uno"), message(2, "dos")];
        let send = fx.sender.send(SendMode::SecuencialEspaciado, batch, 1);
        let peer_side = async {
            let first = peer.answer_submit(STATUS_OK, "ext-1").await;
            let Pdu::SubmitSm(pdu) = first.pdu else { unreachable!() };
            assert_eq!(pdu.short_message, b"uno");
            let second = peer.answer_submit(STATUS_OK, "ext-2").await;
            let Pdu::SubmitSm(pdu) = second.pdu else { unreachable!() };
            assert_eq!(pdu.short_message, b"dos");
        };
        tokio::join!(send, peer_side);

        assert_eq!(fx.store.row(1).unwrap().state, "E");
        assert_eq!(fx.store.row(2).unwrap().state, "E");
    }

    #[tokio::test]
    async fn spaced_parallel_mode_paces_from_a_single_task() {
        let (fx, mut peer) = fixture().await;
        fx.store.insert_pending(1, "0972100000", "uno");
        fx.store.insert_pending(2, "0972100000", "dos");

        // Returns immediately; a pacer task drives the batch.
        fx.sender
            .send(
                SendMode::ParaleloEspaciado,
                vec![message(1, "uno"), message(2, "dos")],
                1,
            )
            .await;

        let first = peer.answer_submit(STATUS_OK, "ext-1").await;
        let Pdu::SubmitSm(pdu) = first.pdu else { unreachable!() };
        assert_eq!(pdu.short_message, b"uno");
        let second = peer.answer_submit(STATUS_OK, "ext-2").await;
        let Pdu::SubmitSm(pdu) = second.pdu else { unreachable!() };
        assert_eq!(pdu.short_message, b"dos");

        fx.sender.shutdown().await;
        assert_eq!(fx.store.row(1).unwrap().state, "E");
        assert_eq!(fx.store.row(2).unwrap().state, "E");
    }

    #[tokio::test]
    async fn async_sequential_mode_completes_in_the_background() {
        let (fx, mut peer) = fixture().await;
        fx.store.insert_pending(1, "0972100000", "uno");

        fx.sender
            .send(SendMode::SecuencialEspaciadoAsync, vec![message(1, "uno")], 1)
            .await;

        peer.answer_submit(STATUS_OK, "ext-1").await;

        // Draining the worker set guarantees the chain ran to completion.
        fx.sender.shutdown().await;
        assert_eq!(fx.store.row(1).unwrap().state, "E");
        assert_eq!(fx.store.row(1).unwrap().external_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn shutdown_rejects_later_batches() {
        let (fx, _peer) = fixture().await;
        fx.sender.shutdown().await;

        fx.store.insert_pending(10, "0972100000", "Hola");
        fx.sender
            .send(SendMode::Paralelo, vec![message(10, "Hola")], 0)
            .await;

        // Nothing ran: the row is untouched.
        assert_eq!(fx.store.row(10).unwrap().attempts, 0);
        assert_eq!(fx.store.row(10).unwrap().state, "P");
    }
}
