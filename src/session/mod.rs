//! SMPP session lifecycle: one bound transceiver per carrier service.
//!
//! A [`Session`] is a cheap handle over a connection actor that owns the
//! framed socket. Submits travel over a command channel and wait on a
//! per-slot oneshot; inbound PDUs are dispatched to the service's
//! [`DeliverHandler`] from the actor itself.

mod inbound;
mod manager;
mod monitor;
mod window;

pub use inbound::{DeliverHandler, InboundHandler};
pub use manager::{SessionManager, SessionProvider};
pub use monitor::{DegradationTracker, WindowMonitorConfig};
pub use window::{SendWindow, WindowSlot};

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::wire::{
    CommandId, DeliverSmResp, Frame, Pdu, PduHeader, SmppCodec, SubmitSm, WireError,
    BindTransceiver, INTERFACE_VERSION_3_4, NPI_ISDN, STATUS_OK, TON_INTERNATIONAL,
};

use window::PendingSlot;

/// Sequence number used for the bind request; submits start after it.
const BIND_SEQUENCE: u32 = 1;

/// command_status sent in a generic_nack for an unknown command id.
const STATUS_INVALID_COMMAND_ID: u32 = 0x0000_0003;

/// Session-level errors surfaced to the sender.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("sin respuesta del proveedor dentro del tiempo límite")]
    Timeout,

    #[error("bind rechazado por el proveedor: status={status:#x}")]
    BindRejected { status: u32 },

    #[error("slot cancelado sin respuesta")]
    Cancelled,

    #[error("sesión cerrada")]
    Closed,
}

/// Carrier answer to one submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub command_status: u32,
    pub message_id: String,
}

impl SubmitOutcome {
    pub fn is_ok(&self) -> bool {
        self.command_status == STATUS_OK
    }
}

/// Parameters for establishing one transceiver session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session name used in logs, `SMPP-RiskSession-<systemId>` by default.
    pub name: String,
    pub system_id: String,
    pub password: String,
    pub system_type: String,
    pub window_size: usize,
    pub log_bytes: bool,
    pub bind_timeout: Duration,
}

impl SessionConfig {
    pub fn new(system_id: impl Into<String>, password: impl Into<String>, window_size: usize) -> Self {
        let system_id = system_id.into();
        Self {
            name: format!("SMPP-RiskSession-{system_id}"),
            system_id,
            password: password.into(),
            system_type: String::new(),
            window_size,
            log_bytes: true,
            bind_timeout: Duration::from_secs(10),
        }
    }
}

enum Command {
    Submit {
        pdu: Box<SubmitSm>,
        permit: OwnedSemaphorePermit,
        responder: oneshot::Sender<Result<SubmitOutcome, SessionError>>,
    },
    Unbind {
        responder: oneshot::Sender<()>,
    },
}

/// Handle over one bound transceiver session.
pub struct Session {
    name: String,
    cmd_tx: mpsc::Sender<Command>,
    window: Arc<SendWindow>,
    bound: Arc<AtomicBool>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Dial the carrier and perform the transceiver bind handshake.
    pub async fn connect(
        host: &str,
        port: u16,
        config: SessionConfig,
        handler: Arc<dyn DeliverHandler>,
    ) -> Result<Self, SessionError> {
        let stream = TcpStream::connect((host, port)).await?;
        Self::establish(stream, config, handler).await
    }

    /// Perform the bind handshake over an already-open stream and spawn the
    /// connection actor.
    pub async fn establish<T>(
        stream: T,
        config: SessionConfig,
        handler: Arc<dyn DeliverHandler>,
    ) -> Result<Self, SessionError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(stream, SmppCodec::new(&config.name, config.log_bytes));

        let bind = BindTransceiver {
            system_id: config.system_id.clone(),
            password: config.password.clone(),
            system_type: config.system_type.clone(),
            interface_version: INTERFACE_VERSION_3_4,
            addr_ton: TON_INTERNATIONAL,
            addr_npi: NPI_ISDN,
            address_range: String::new(),
        };
        framed
            .send(Frame::new(
                PduHeader::new(CommandId::BindTransceiver, BIND_SEQUENCE),
                Pdu::BindTransceiver(bind),
            ))
            .await?;

        let deadline = Instant::now() + config.bind_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match timeout(remaining, framed.next()).await {
                Err(_) => return Err(SessionError::Timeout),
                Ok(None) => return Err(SessionError::Closed),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(frame))) => frame,
            };
            let sequence = frame.sequence();
            let status = frame.status();

            match frame.pdu {
                Pdu::BindTransceiverResp(resp) => {
                    if status != STATUS_OK {
                        return Err(SessionError::BindRejected { status });
                    }
                    debug!(
                        session = %config.name,
                        system_id = %resp.system_id,
                        "bind transceiver aceptado"
                    );
                    break;
                }
                Pdu::EnquireLink => {
                    framed
                        .send(Frame::new(
                            PduHeader::new(CommandId::EnquireLinkResp, sequence),
                            Pdu::EnquireLinkResp,
                        ))
                        .await?;
                }
                _ => {
                    warn!(session = %config.name, "PDU inesperado durante el bind");
                }
            }
        }

        let window = Arc::new(SendWindow::new(config.window_size));
        let bound = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let actor = Actor {
            name: config.name.clone(),
            framed,
            cmd_rx,
            window: Arc::clone(&window),
            bound: Arc::clone(&bound),
            handler,
            sequence: BIND_SEQUENCE,
        };
        let handle = tokio::spawn(actor.run());

        Ok(Self {
            name: config.name,
            cmd_tx,
            window,
            bound,
            actor: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    /// In-flight request window; the monitor inspects and cancels through it.
    pub fn window(&self) -> &SendWindow {
        &self.window
    }

    /// Submit one PDU and wait for the carrier response. The deadline covers
    /// both window admission and the response wait; on expiry the occupied
    /// slot stays in the window until the response or a manual cancel.
    pub async fn submit(&self, pdu: SubmitSm, wait: Duration) -> Result<SubmitOutcome, SessionError> {
        match timeout(wait, self.submit_inner(pdu)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout),
        }
    }

    async fn submit_inner(&self, pdu: SubmitSm) -> Result<SubmitOutcome, SessionError> {
        let permit = self.window.acquire().await?;
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit {
                pdu: Box::new(pdu),
                permit,
                responder,
            })
            .await
            .map_err(|_| SessionError::Closed)?;

        rx.await.map_err(|_| SessionError::Cancelled)?
    }

    /// Send unbind and wait up to `wait` for the provider's unbind_resp.
    pub async fn unbind(&self, wait: Duration) -> Result<(), SessionError> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unbind { responder })
            .await
            .map_err(|_| SessionError::Closed)?;

        timeout(wait, rx)
            .await
            .map_err(|_| SessionError::Timeout)?
            .map_err(|_| SessionError::Closed)
    }

    /// Tear down the connection actor and liberate every pending slot.
    pub fn destroy(&self) {
        self.bound.store(false, Ordering::SeqCst);
        if let Some(handle) = self.actor.lock().unwrap().take() {
            handle.abort();
        }
        self.window.clear();
    }
}

struct Actor<T> {
    name: String,
    framed: Framed<T, SmppCodec>,
    cmd_rx: mpsc::Receiver<Command>,
    window: Arc<SendWindow>,
    bound: Arc<AtomicBool>,
    handler: Arc<dyn DeliverHandler>,
    sequence: u32,
}

impl<T> Actor<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let mut pending_unbind: Option<oneshot::Sender<()>> = None;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => break,
                        Some(Command::Submit { pdu, permit, responder }) => {
                            if !self.handle_submit(pdu, permit, responder).await {
                                break;
                            }
                        }
                        Some(Command::Unbind { responder }) => {
                            self.bound.store(false, Ordering::SeqCst);
                            pending_unbind = Some(responder);
                            let sequence = self.next_sequence();
                            let frame = Frame::new(PduHeader::new(CommandId::Unbind, sequence), Pdu::Unbind);
                            if self.framed.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                frame = self.framed.next() => {
                    match frame {
                        None => {
                            debug!(session = %self.name, "conexión cerrada por el proveedor");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(session = %self.name, error = %e, "error de framing");
                            break;
                        }
                        Some(Ok(frame)) => {
                            if self.handle_frame(frame, &mut pending_unbind).await.is_break() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.bound.store(false, Ordering::SeqCst);
        self.window.clear();
    }

    /// Returns false when the connection is beyond recovery.
    async fn handle_submit(
        &mut self,
        pdu: Box<SubmitSm>,
        permit: OwnedSemaphorePermit,
        responder: oneshot::Sender<Result<SubmitOutcome, SessionError>>,
    ) -> bool {
        let sequence = self.next_sequence();
        self.window.insert(
            sequence,
            PendingSlot {
                offered_at: Instant::now(),
                responder,
                _permit: permit,
            },
        );

        let frame = Frame::new(PduHeader::new(CommandId::SubmitSm, sequence), Pdu::SubmitSm(pdu));
        match self.framed.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                let fatal = matches!(e, WireError::Io(_));
                error!(session = %self.name, sequence, error = %e, "fallo al enviar submit_sm");
                if let Some(slot) = self.window.take(sequence) {
                    let _ = slot.responder.send(Err(e.into()));
                }
                !fatal
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        pending_unbind: &mut Option<oneshot::Sender<()>>,
    ) -> ControlFlow<()> {
        let sequence = frame.sequence();

        match frame.pdu {
            Pdu::SubmitSmResp(resp) => {
                match self.window.take(sequence) {
                    Some(slot) => {
                        let _ = slot.responder.send(Ok(SubmitOutcome {
                            command_status: frame.header.command_status,
                            message_id: resp.message_id,
                        }));
                    }
                    None => {
                        warn!(session = %self.name, sequence, "respuesta sin slot pendiente");
                    }
                }
                ControlFlow::Continue(())
            }

            Pdu::DeliverSm(deliver) => {
                let status = self.handler.on_deliver(&deliver).await;
                let resp = Frame::new(
                    PduHeader::with_status(CommandId::DeliverSmResp, sequence, status),
                    Pdu::DeliverSmResp(DeliverSmResp::default()),
                );
                if self.framed.send(resp).await.is_err() {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }

            Pdu::EnquireLink => {
                let resp = Frame::new(
                    PduHeader::new(CommandId::EnquireLinkResp, sequence),
                    Pdu::EnquireLinkResp,
                );
                if self.framed.send(resp).await.is_err() {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }

            Pdu::Unbind => {
                debug!(session = %self.name, "unbind solicitado por el proveedor");
                self.bound.store(false, Ordering::SeqCst);
                let resp = Frame::new(PduHeader::new(CommandId::UnbindResp, sequence), Pdu::UnbindResp);
                let _ = self.framed.send(resp).await;
                ControlFlow::Break(())
            }

            Pdu::UnbindResp => {
                if let Some(tx) = pending_unbind.take() {
                    let _ = tx.send(());
                }
                ControlFlow::Break(())
            }

            Pdu::GenericNack => {
                warn!(session = %self.name, status = frame.header.command_status, "generic_nack recibido");
                ControlFlow::Continue(())
            }

            Pdu::Unknown { .. } => {
                let resp = Frame::new(
                    PduHeader::with_status(CommandId::GenericNack, sequence, STATUS_INVALID_COMMAND_ID),
                    Pdu::GenericNack,
                );
                if self.framed.send(resp).await.is_err() {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }

            _ => {
                warn!(session = %self.name, sequence, "PDU no esperado en esta dirección");
                ControlFlow::Continue(())
            }
        }
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = if self.sequence >= 0x7FFF_FFFF {
            1
        } else {
            self.sequence + 1
        };
        self.sequence
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::wire::SubmitSmResp;
    use std::sync::Mutex as StdMutex;
    use tokio::io::duplex;

    struct RecordingHandler {
        seen: StdMutex<Vec<DeliverSmRecord>>,
    }

    #[derive(Debug, Clone)]
    struct DeliverSmRecord {
        source: String,
        dest: String,
        text: String,
        esm_class: u8,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl DeliverHandler for RecordingHandler {
        async fn on_deliver(&self, deliver: &crate::wire::DeliverSm) -> u32 {
            self.seen.lock().unwrap().push(DeliverSmRecord {
                source: deliver.source_addr.clone(),
                dest: deliver.dest_addr.clone(),
                text: String::from_utf8_lossy(&deliver.short_message).into_owned(),
                esm_class: deliver.esm_class,
            });
            STATUS_OK
        }
    }

    #[tokio::test]
    async fn bind_rejection_surfaces_status() {
        let (client, server) = duplex(4096);
        let establish = Session::establish(client, test_config(4), RecordingHandler::new());
        let peer = async {
            let mut peer = Peer::new(server);
            let bind = peer.expect().await;
            peer.send(Frame::new(
                PduHeader::with_status(CommandId::BindTransceiverResp, bind.sequence(), 0x0D),
                Pdu::BindTransceiverResp(Default::default()),
            ))
            .await;
        };

        let (result, _) = tokio::join!(establish, peer);
        assert!(matches!(
            result,
            Err(SessionError::BindRejected { status: 0x0D })
        ));
    }

    #[tokio::test]
    async fn submit_roundtrip_returns_carrier_outcome() {
        let (session, mut peer) = bound_pair(4, RecordingHandler::new()).await;

        let submitted = tokio::spawn(async move {
            let peer_frame = peer.expect().await;
            let Pdu::SubmitSm(ref pdu) = peer_frame.pdu else {
                panic!("expected submit_sm");
            };
            assert_eq!(pdu.short_message, b"Hola");
            peer.send(Frame::new(
                PduHeader::with_status(CommandId::SubmitSmResp, peer_frame.sequence(), STATUS_OK),
                Pdu::SubmitSmResp(SubmitSmResp {
                    message_id: "ext-42".into(),
                }),
            ))
            .await;
            peer
        });

        let outcome = session
            .submit(submit_for("0972100000", b"Hola"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.message_id, "ext-42");
        assert!(session.window().is_empty());

        submitted.await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_submit_leaves_slot_until_cancel() {
        let (session, mut peer) = bound_pair(4, RecordingHandler::new()).await;

        // The peer swallows the submit and never answers.
        let silent_peer = tokio::spawn(async move {
            let _ = peer.expect().await;
            peer
        });

        let result = session
            .submit(submit_for("0972100000", b"Hola"), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SessionError::Timeout)));

        // The slot is still occupied; a manual cancel liberates it.
        let snapshot = session.window().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(session.window().cancel(snapshot[0].sequence).is_some());
        assert!(session.window().is_empty());

        silent_peer.await.unwrap();
    }

    #[tokio::test]
    async fn full_window_blocks_until_the_deadline() {
        let (session, mut peer) = bound_pair(1, RecordingHandler::new()).await;

        let silent_peer = tokio::spawn(async move {
            let _ = peer.expect().await;
            peer
        });

        let first = session
            .submit(submit_for("0972100000", b"uno"), Duration::from_millis(50))
            .await;
        assert!(matches!(first, Err(SessionError::Timeout)));

        // Window of one is now saturated: the next submit cannot even offer.
        let second = session
            .submit(submit_for("0972100000", b"dos"), Duration::from_millis(50))
            .await;
        assert!(matches!(second, Err(SessionError::Timeout)));
        assert_eq!(session.window().len(), 1);

        silent_peer.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_deliver_sm_reaches_handler_and_is_acked() {
        let handler = RecordingHandler::new();
        let (session, mut peer) = bound_pair(4, handler.clone()).await;

        peer.send(Frame::new(
            PduHeader::new(CommandId::DeliverSm, 77),
            Pdu::DeliverSm(Box::new(crate::wire::DeliverSm {
                source_addr: "0981555111".into(),
                dest_addr: "RISK".into(),
                short_message: b"hola".to_vec(),
                ..Default::default()
            })),
        ))
        .await;

        let resp = peer.expect().await;
        assert_eq!(resp.sequence(), 77);
        assert!(matches!(resp.pdu, Pdu::DeliverSmResp(_)));
        assert_eq!(resp.status(), STATUS_OK);

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].source, "0981555111");
        assert_eq!(seen[0].text, "hola");
        assert_eq!(seen[0].esm_class, 0x00);

        drop(session);
    }

    #[tokio::test]
    async fn enquire_link_is_answered() {
        let (session, mut peer) = bound_pair(4, RecordingHandler::new()).await;

        peer.send(Frame::new(PduHeader::new(CommandId::EnquireLink, 12), Pdu::EnquireLink))
            .await;
        let resp = peer.expect().await;
        assert_eq!(resp.sequence(), 12);
        assert!(matches!(resp.pdu, Pdu::EnquireLinkResp));

        drop(session);
    }

    #[tokio::test]
    async fn unbind_waits_for_the_response() {
        let (session, mut peer) = bound_pair(4, RecordingHandler::new()).await;

        let peer_task = tokio::spawn(async move {
            let unbind = peer.expect().await;
            assert!(matches!(unbind.pdu, Pdu::Unbind));
            peer.send(Frame::new(
                PduHeader::new(CommandId::UnbindResp, unbind.sequence()),
                Pdu::UnbindResp,
            ))
            .await;
        });

        session.unbind(Duration::from_secs(1)).await.unwrap();
        assert!(!session.is_bound());
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn peer_hangup_unbinds_the_session() {
        let (session, peer) = bound_pair(4, RecordingHandler::new()).await;
        assert!(session.is_bound());

        drop(peer);
        // The actor notices EOF and clears the bound flag.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.is_bound());
    }
}
