//! In-memory message store.
//!
//! Volatile backend with the same update semantics as the Postgres store.
//! Used by unit and integration tests; all data is lost on drop.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use tracing::debug;

use crate::model::{MessageStatus, SmsMessage};

use super::{truncate, MessageStore, DEFAULT_MAX_ATTEMPTS, EXTERNAL_ID_MAX, RESPONSE_TEXT_MAX};

/// One queue row, conceptual columns only.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: BigDecimal,
    pub destination: String,
    pub content: String,
    pub state: String,
    pub response_code: Option<i32>,
    pub response_text: Option<String>,
    pub external_id: Option<String>,
    pub attempts: i32,
    pub sent_at: Option<SystemTime>,
    pub carrier: Option<String>,
    pub priority: Option<i32>,
    pub classification: Option<String>,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<BigDecimal, MessageRow>,
    received: Vec<(BigDecimal, String, String, String)>,
    next_received_id: i64,
}

/// Volatile [`MessageStore`] used in tests.
pub struct MemoryMessageStore {
    inner: Mutex<Inner>,
    max_attempts: i32,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl MemoryMessageStore {
    pub fn new(max_attempts: i32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_received_id: 1,
                ..Inner::default()
            }),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Seed one pending row.
    pub fn insert_pending(&self, id: i64, destination: &str, content: &str) {
        self.insert_row(MessageRow {
            id: BigDecimal::from(id),
            destination: destination.to_string(),
            content: content.to_string(),
            state: MessageStatus::PendingSend.code().to_string(),
            response_code: None,
            response_text: None,
            external_id: None,
            attempts: 0,
            sent_at: None,
            carrier: None,
            priority: None,
            classification: None,
        });
    }

    pub fn insert_row(&self, row: MessageRow) {
        let mut inner = self.inner.lock().unwrap();
        inner.rows.insert(row.id.clone(), row);
    }

    pub fn row(&self, id: i64) -> Option<MessageRow> {
        let inner = self.inner.lock().unwrap();
        inner.rows.get(&BigDecimal::from(id)).cloned()
    }

    /// Mobile-originated rows captured so far: `(id, origin, destination, text)`.
    pub fn received(&self) -> Vec<(BigDecimal, String, String, String)> {
        self.inner.lock().unwrap().received.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn load_pending_messages(
        &self,
        source: &str,
        carrier: Option<&str>,
        classification: Option<&str>,
        limit: i64,
    ) -> Vec<SmsMessage> {
        let inner = self.inner.lock().unwrap();

        let mut rows: Vec<&MessageRow> = inner
            .rows
            .values()
            .filter(|row| row.state == MessageStatus::PendingSend.code())
            .filter(|row| carrier.map_or(true, |c| row.carrier.as_deref() == Some(c)))
            .filter(|row| {
                classification.map_or(true, |c| row.classification.as_deref() == Some(c))
            })
            .collect();

        rows.sort_by(|a, b| {
            let pa = a.priority.unwrap_or(997);
            let pb = b.priority.unwrap_or(997);
            pa.cmp(&pb).then_with(|| a.id.cmp(&b.id))
        });

        rows.into_iter()
            .take(limit.max(0) as usize)
            .map(|row| SmsMessage::new(row.id.clone(), source, row.destination.clone(), row.content.clone()))
            .collect()
    }

    async fn update_message_status(
        &self,
        id: &BigDecimal,
        status: MessageStatus,
        response_code: Option<i32>,
        response_text: Option<&str>,
        external_id: Option<&str>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let Some(row) = inner.rows.get_mut(id) else {
            debug!(%id, "fila inexistente, actualización ignorada");
            return;
        };

        let capped = status == MessageStatus::PendingSend && row.attempts >= self.max_attempts - 1;
        row.state = if capped {
            MessageStatus::ErrorProcessed.code().to_string()
        } else {
            status.code().to_string()
        };

        if let Some(code) = response_code {
            row.response_code = Some(code);
        }
        if let Some(text) = response_text {
            row.response_text = Some(truncate(text, RESPONSE_TEXT_MAX).to_string());
        }
        if let Some(ext) = external_id {
            row.external_id = Some(truncate(ext, EXTERNAL_ID_MAX).to_string());
        }

        if status != MessageStatus::InProgress {
            row.attempts += 1;
        }
        if status == MessageStatus::Sent {
            row.sent_at = Some(SystemTime::now());
        }
    }

    async fn bulk_claim(
        &self,
        mut messages: Vec<SmsMessage>,
        status: MessageStatus,
    ) -> Vec<SmsMessage> {
        // No concurrent lockers in the volatile store: every row claims.
        let mut inner = self.inner.lock().unwrap();
        messages.retain(|m| inner.rows.contains_key(&m.id));
        for message in &messages {
            if let Some(row) = inner.rows.get_mut(&message.id) {
                row.state = status.code().to_string();
            }
        }
        messages
    }

    async fn save_received_message(
        &self,
        origin: &str,
        destination: &str,
        text: &str,
    ) -> Option<BigDecimal> {
        let mut inner = self.inner.lock().unwrap();
        let id = BigDecimal::from(inner.next_received_id);
        inner.next_received_id += 1;
        inner.received.push((
            id.clone(),
            origin.to_string(),
            destination.to_string(),
            text.to_string(),
        ));
        Some(id)
    }
}
