//! Postgres-backed message store.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, error, warn};

use crate::config::DataSourceConfig;
use crate::model::{MessageStatus, SmsMessage};

use super::{truncate, MessageStore, DEFAULT_MAX_ATTEMPTS, EXTERNAL_ID_MAX, RESPONSE_TEXT_MAX};

const LOAD_PENDING: &str = r#"
SELECT m.id, m.destination, COALESCE(m.content, '') AS content
  FROM messages m
  JOIN message_categories c ON c.id = m.category_id
 WHERE m.state = $1
   AND ($2::text IS NULL OR m.carrier = $2)
   AND ($3::text IS NULL OR c.classification = $3)
 ORDER BY COALESCE(c.priority, 997), m.id
 LIMIT $4
"#;

// The cap rule, attempt accounting, sent_at stamping and coalesced response
// fields must land in one statement so a single commit upholds the row
// invariants.
const UPDATE_STATUS: &str = r#"
UPDATE messages
   SET state = CASE
                 WHEN $2 = 'P' AND COALESCE(attempts, 0) >= $3 THEN 'R'
                 ELSE $2
               END,
       response_code = COALESCE($4, response_code),
       response_text = COALESCE(LEFT($5, 1000), response_text),
       external_id   = COALESCE(LEFT($6, 100), external_id),
       attempts = CASE
                    WHEN $2 = 'N' THEN COALESCE(attempts, 0)
                    ELSE COALESCE(attempts, 0) + 1
                  END,
       sent_at = CASE WHEN $2 = 'E' THEN CURRENT_TIMESTAMP ELSE sent_at END
 WHERE id = $1
"#;

// SKIP LOCKED is the set-based rendition of the original per-row
// SELECT ... FOR UPDATE NOWAIT claim: busy rows fall out of the result
// instead of blocking the worker.
const BULK_CLAIM: &str = r#"
WITH locked AS (
    SELECT id
      FROM messages
     WHERE id = ANY($1)
       FOR UPDATE SKIP LOCKED
)
UPDATE messages m
   SET state = $2
  FROM locked
 WHERE m.id = locked.id
 RETURNING m.id
"#;

const SAVE_RECEIVED: &str = r#"
INSERT INTO received_messages (origin, destination, content)
VALUES ($1, $2, $3)
RETURNING id
"#;

/// Message store over a shared Postgres connection pool.
///
/// The pool is the only shared mutable state; handles are cheap clones, so
/// each service carries its own copy with its own attempt cap.
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
    max_attempts: i32,
}

impl PgMessageStore {
    /// Build the pool from the datasource section. Connections are opened
    /// lazily: an unreachable database delays the first batch instead of
    /// failing startup.
    pub fn connect(ds: &DataSourceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(ds.maximum_pool_size)
            .min_connections(ds.minimum_idle)
            .idle_timeout(Duration::from_millis(ds.idle_timeout_ms))
            .acquire_timeout(Duration::from_millis(ds.connection_timeout_ms))
            .connect_lazy(&ds.url())?;

        Ok(Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Same pool, different attempt cap; used to give each configured service
    /// its own `maximoIntentos`.
    pub fn with_max_attempts(&self, max_attempts: i32) -> Self {
        Self {
            pool: self.pool.clone(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn load_pending_messages(
        &self,
        source: &str,
        carrier: Option<&str>,
        classification: Option<&str>,
        limit: i64,
    ) -> Vec<SmsMessage> {
        debug!(?carrier, ?classification, limit, "recuperando mensajes pendientes");

        let rows = sqlx::query(LOAD_PENDING)
            .bind(MessageStatus::PendingSend.code())
            .bind(carrier)
            .bind(classification)
            .bind(limit)
            .fetch_all(&self.pool)
            .await;

        match rows {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    let id: BigDecimal = row.try_get("id").ok()?;
                    let destination: String = row.try_get("destination").ok()?;
                    let content: String = row.try_get("content").ok()?;
                    Some(SmsMessage::new(id, source, destination, content))
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "error al recuperar mensajes pendientes");
                Vec::new()
            }
        }
    }

    async fn update_message_status(
        &self,
        id: &BigDecimal,
        status: MessageStatus,
        response_code: Option<i32>,
        response_text: Option<&str>,
        external_id: Option<&str>,
    ) {
        debug!(
            %id,
            estado = %status,
            codigo = ?response_code,
            "actualizando estado de mensaje"
        );

        let result = sqlx::query(UPDATE_STATUS)
            .bind(id)
            .bind(status.code())
            .bind(self.max_attempts - 1)
            .bind(response_code)
            .bind(response_text.map(|t| truncate(t, RESPONSE_TEXT_MAX)))
            .bind(external_id.map(|t| truncate(t, EXTERNAL_ID_MAX)))
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            error!(%id, error = %e, "error al actualizar estado de mensaje");
        }
    }

    async fn bulk_claim(
        &self,
        mut messages: Vec<SmsMessage>,
        status: MessageStatus,
    ) -> Vec<SmsMessage> {
        if messages.is_empty() {
            return messages;
        }
        debug!(count = messages.len(), estado = %status, "reclamando mensajes");

        let ids: Vec<BigDecimal> = messages.iter().map(|m| m.id.clone()).collect();

        let rows = sqlx::query(BULK_CLAIM)
            .bind(&ids)
            .bind(status.code())
            .fetch_all(&self.pool)
            .await;

        match rows {
            Ok(rows) => {
                let claimed: HashSet<BigDecimal> = rows
                    .into_iter()
                    .filter_map(|row| row.try_get::<BigDecimal, _>("id").ok())
                    .collect();

                if claimed.len() < messages.len() {
                    warn!(
                        skipped = messages.len() - claimed.len(),
                        "mensajes bloqueados por otro proceso, se omiten del lote"
                    );
                }

                messages.retain(|m| claimed.contains(&m.id));
                messages
            }
            Err(e) => {
                error!(error = %e, "error al reclamar mensajes del lote");
                Vec::new()
            }
        }
    }

    async fn save_received_message(
        &self,
        origin: &str,
        destination: &str,
        text: &str,
    ) -> Option<BigDecimal> {
        debug!(origen = %origin, destino = %destination, "insertando mensaje recibido");

        let row = sqlx::query(SAVE_RECEIVED)
            .bind(origin)
            .bind(destination)
            .bind(text)
            .fetch_one(&self.pool)
            .await;

        match row {
            Ok(row) => row.try_get::<i64, _>("id").ok().map(BigDecimal::from),
            Err(e) => {
                error!(origen = %origin, error = %e, "error al insertar mensaje recibido");
                None
            }
        }
    }
}
