//! Message queue persistence.
//!
//! The store is the only component that touches durable storage. Every
//! operation commits per call and traps its own errors: a failing database
//! never aborts a polling loop, it only costs the current batch.
//!
//! # Implementations
//!
//! - [`PgMessageStore`]: production backend over a shared Postgres pool
//! - [`MemoryMessageStore`]: volatile backend with identical semantics,
//!   used by tests

mod memory;
mod postgres;

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;

use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use crate::model::{MessageStatus, SmsMessage};

/// Default number of rows a single poll may claim.
pub const DEFAULT_BATCH_LIMIT: i64 = 100;

/// Default attempt cap before a pending update is demoted to error-processed.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Longest response text persisted; the column is VARCHAR(1000).
pub const RESPONSE_TEXT_MAX: usize = 1000;

/// Longest external id persisted; the column is VARCHAR(100).
pub const EXTERNAL_ID_MAX: usize = 100;

/// Queue access used by the polling loops, the sender and the inbound path.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Load up to `limit` pending rows, joined to their category, filtered by
    /// carrier and classification when given (`None` = wildcard), ordered by
    /// `(priority asc nulls→997, id asc)`. `source` is not a filter: it is
    /// copied into each returned message as the sender address.
    ///
    /// Query errors are logged and yield an empty batch.
    async fn load_pending_messages(
        &self,
        source: &str,
        carrier: Option<&str>,
        classification: Option<&str>,
        limit: i64,
    ) -> Vec<SmsMessage>;

    /// Apply one send outcome to one row, as a single committed statement:
    ///
    /// - a `PendingSend` update on a row whose attempts already reached
    ///   `max_attempts - 1` commits as `ErrorProcessed` instead;
    /// - `attempts` increments, except when the new state is `InProgress`;
    /// - `sent_at` is stamped if and only if the new state is `Sent`;
    /// - response fields coalesce: `None` leaves the column untouched, text
    ///   is truncated to its column length.
    async fn update_message_status(
        &self,
        id: &BigDecimal,
        status: MessageStatus,
        response_code: Option<i32>,
        response_text: Option<&str>,
        external_id: Option<&str>,
    );

    /// Claim `messages` for this worker by taking non-blocking row locks and
    /// setting `status` on the rows that could be locked. Rows locked by a
    /// concurrent worker are dropped from the returned batch.
    async fn bulk_claim(
        &self,
        messages: Vec<SmsMessage>,
        status: MessageStatus,
    ) -> Vec<SmsMessage>;

    /// Persist one mobile-originated message; returns the new row id, or
    /// `None` when the insert failed.
    async fn save_received_message(
        &self,
        origin: &str,
        destination: &str,
        text: &str,
    ) -> Option<BigDecimal>;
}

/// Store handle shared by the components of one service.
pub type SharedStore = Arc<dyn MessageStore>;

/// Character-truncate `text` to the declared column length.
pub(crate) fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
