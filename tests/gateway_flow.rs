//! End-to-end flows against an in-process mock SMSC.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use smsgwd::config::SmppConfig;
use smsgwd::model::{SendMode, SmsMessage};
use smsgwd::sender::Sender;
use smsgwd::session::SessionManager;
use smsgwd::stats::LatencyStats;
use smsgwd::store::{MemoryMessageStore, SharedStore};
use smsgwd::wire::{
    CommandId, DeliverSm, Frame, Pdu, PduHeader, SmppCodec, SubmitSmResp, STATUS_OK,
};

enum MockCommand {
    Inject(Frame),
    CloseConnection,
}

/// Minimal carrier double: accepts binds, acknowledges submits with
/// sequential external ids, answers enquire_link and unbind.
struct MockSmsc {
    addr: SocketAddr,
    control: mpsc::UnboundedSender<MockCommand>,
    binds: Arc<AtomicUsize>,
}

impl MockSmsc {
    /// `close_after_submits`: drop the connection (without answering) once
    /// that many submits have already been acknowledged.
    async fn spawn(close_after_submits: Option<usize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (control, mut control_rx) = mpsc::unbounded_channel();
        let binds = Arc::new(AtomicUsize::new(0));

        let bind_counter = Arc::clone(&binds);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let mut framed = Framed::new(stream, SmppCodec::new("mock-smsc", false));
                let mut acknowledged = 0usize;

                'connection: loop {
                    tokio::select! {
                        command = control_rx.recv() => match command {
                            None => return,
                            Some(MockCommand::Inject(frame)) => {
                                let _ = framed.send(frame).await;
                            }
                            Some(MockCommand::CloseConnection) => break 'connection,
                        },

                        frame = framed.next() => {
                            let Some(Ok(frame)) = frame else { break 'connection };
                            let sequence = frame.sequence();
                            match frame.pdu {
                                Pdu::BindTransceiver(_) => {
                                    bind_counter.fetch_add(1, Ordering::SeqCst);
                                    let resp = Frame::new(
                                        PduHeader::with_status(
                                            CommandId::BindTransceiverResp,
                                            sequence,
                                            STATUS_OK,
                                        ),
                                        Pdu::BindTransceiverResp(Default::default()),
                                    );
                                    if framed.send(resp).await.is_err() {
                                        break 'connection;
                                    }
                                }
                                Pdu::SubmitSm(_) => {
                                    acknowledged += 1;
                                    let resp = Frame::new(
                                        PduHeader::with_status(
                                            CommandId::SubmitSmResp,
                                            sequence,
                                            STATUS_OK,
                                        ),
                                        Pdu::SubmitSmResp(SubmitSmResp {
                                            message_id: format!("MOCK-{acknowledged}"),
                                        }),
                                    );
                                    if framed.send(resp).await.is_err() {
                                        break 'connection;
                                    }
                                    // Dropping the link right after the ack
                                    // simulates a carrier dying mid-batch.
                                    if close_after_submits == Some(acknowledged) {
                                        break 'connection;
                                    }
                                }
                                Pdu::EnquireLink => {
                                    let resp = Frame::new(
                                        PduHeader::new(CommandId::EnquireLinkResp, sequence),
                                        Pdu::EnquireLinkResp,
                                    );
                                    if framed.send(resp).await.is_err() {
                                        break 'connection;
                                    }
                                }
                                Pdu::Unbind => {
                                    let resp = Frame::new(
                                        PduHeader::new(CommandId::UnbindResp, sequence),
                                        Pdu::UnbindResp,
                                    );
                                    let _ = framed.send(resp).await;
                                    break 'connection;
                                }
                                // deliver_sm_resp acks and anything else are
                                // consumed silently.
                                _ => {}
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            control,
            binds,
        }
    }

    fn smpp_config(&self) -> SmppConfig {
        SmppConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            system_id: "risk".into(),
            password: "secret".into(),
            source_address: "RISK".into(),
            send_delay_ms: 10,
        }
    }

    fn inject(&self, frame: Frame) {
        self.control.send(MockCommand::Inject(frame)).unwrap();
    }

    fn close_connection(&self) {
        let _ = self.control.send(MockCommand::CloseConnection);
    }

    fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

struct Gateway {
    manager: Arc<SessionManager>,
    sender: Arc<Sender>,
    store: Arc<MemoryMessageStore>,
    stats: Arc<LatencyStats>,
    _running: watch::Sender<bool>,
}

async fn gateway_against(mock: &MockSmsc) -> Gateway {
    let (running_tx, running_rx) = watch::channel(true);
    let store = Arc::new(MemoryMessageStore::new(5));
    let shared: SharedStore = store.clone();
    let stats = Arc::new(LatencyStats::new(1_000));
    let manager = SessionManager::new(running_rx);

    manager
        .bind("prueba", shared.clone(), &mock.smpp_config(), stats.clone())
        .await
        .expect("initial bind");

    let sender = Sender::new(
        "prueba",
        manager.provider(),
        shared,
        stats.clone(),
    );

    Gateway {
        manager,
        sender,
        store,
        stats,
        _running: running_tx,
    }
}

fn message(id: i64, text: &str) -> SmsMessage {
    SmsMessage::new(BigDecimal::from(id), "RISK", "0972100000", text)
}

#[tokio::test]
async fn messages_flow_from_store_to_carrier() {
    let mock = MockSmsc::spawn(None).await;
    let gw = gateway_against(&mock).await;

    gw.store.insert_pending(10, "0972100000", "Hola");
    gw.store.insert_pending(11, "0972100001", "Chau");

    gw.sender
        .send(
            SendMode::SecuencialEspaciado,
            vec![message(10, "Hola"), message(11, "Chau")],
            10,
        )
        .await;

    let first = gw.store.row(10).unwrap();
    assert_eq!(first.state, "E");
    assert_eq!(first.attempts, 1);
    assert_eq!(first.external_id.as_deref(), Some("MOCK-1"));
    assert!(first.sent_at.is_some());

    let second = gw.store.row(11).unwrap();
    assert_eq!(second.state, "E");
    assert_eq!(second.external_id.as_deref(), Some("MOCK-2"));

    assert_eq!(gw.stats.total_count(), 2);
    gw.manager.shutdown(true).await;
}

#[tokio::test]
async fn mobile_originated_messages_land_in_the_store() {
    let mock = MockSmsc::spawn(None).await;
    let gw = gateway_against(&mock).await;

    mock.inject(Frame::new(
        PduHeader::new(CommandId::DeliverSm, 500),
        Pdu::DeliverSm(Box::new(DeliverSm {
            source_addr: "0981555111".into(),
            dest_addr: "RISK".into(),
            short_message: b"hola risk".to_vec(),
            ..Default::default()
        })),
    ));

    // A delivery receipt must be logged, never persisted.
    mock.inject(Frame::new(
        PduHeader::new(CommandId::DeliverSm, 501),
        Pdu::DeliverSm(Box::new(DeliverSm {
            source_addr: "0981555111".into(),
            dest_addr: "RISK".into(),
            esm_class: 0x04,
            short_message: b"id:MOCK-1 sub:001 stat:DELIVRD err:000".to_vec(),
            ..Default::default()
        })),
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let received = gw.store.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1, "0981555111");
    assert_eq!(received[0].3, "hola risk");

    gw.manager.shutdown(true).await;
}

#[tokio::test]
async fn session_loss_mid_batch_sets_the_synthetic_code() {
    // The carrier acknowledges one submit, then drops the connection.
    let mock = MockSmsc::spawn(Some(1)).await;
    let gw = gateway_against(&mock).await;

    gw.store.insert_pending(10, "0972100000", "uno");
    gw.store.insert_pending(11, "0972100000", "dos");

    gw.sender
        .send(
            SendMode::SecuencialEspaciado,
            vec![message(10, "uno"), message(11, "dos")],
            100,
        )
        .await;

    let first = gw.store.row(10).unwrap();
    assert_eq!(first.state, "E");

    // The second message never reached the wire: pending with the
    // session-unavailable code, no external id.
    let second = gw.store.row(11).unwrap();
    assert_eq!(second.state, "P");
    assert_eq!(second.response_code, Some(999_998));
    assert_eq!(second.response_text.as_deref(), Some("Sesión no disponible"));
    assert_eq!(second.external_id, None);
}

#[tokio::test(start_paused = true)]
async fn rebind_swaps_the_session_behind_the_provider() {
    let mock = MockSmsc::spawn(None).await;
    let gw = gateway_against(&mock).await;
    assert_eq!(mock.bind_count(), 1);

    let before = gw.manager.current_session().expect("bound session");

    gw.manager.rebind().await;

    let after = gw.manager.current_session().expect("rebound session");
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(after.is_bound());
    assert_eq!(mock.bind_count(), 2);

    gw.manager.shutdown(true).await;
}

#[tokio::test]
async fn closed_connection_unbinds_the_provider_session() {
    let mock = MockSmsc::spawn(None).await;
    let gw = gateway_against(&mock).await;

    let session = gw.manager.current_session().unwrap();
    assert!(session.is_bound());

    mock.close_connection();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!session.is_bound());
}
