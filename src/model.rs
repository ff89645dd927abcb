//! Core domain types shared across the gateway.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

/// One SMS message pulled from (or headed into) the outbound queue.
///
/// Immutable value object; the persistent row carries the mutable send state.
#[derive(Debug, Clone, PartialEq)]
pub struct SmsMessage {
    /// Queue row identity (arbitrary-precision, matches the NUMERIC column).
    pub id: BigDecimal,
    /// Sender address the service submits with.
    pub source: String,
    /// Recipient address.
    pub destination: String,
    /// Message body, UTF-8 in memory.
    pub text: String,
}

impl SmsMessage {
    pub fn new(
        id: impl Into<BigDecimal>,
        source: impl Into<String>,
        destination: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            destination: destination.into(),
            text: text.into(),
        }
    }
}

/// Persistent send state of a queue row. Wire codes are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Awaiting dispatch (`"P"`).
    PendingSend,
    /// Claimed by a worker (`"N"`).
    InProgress,
    /// Accepted by the carrier (`"E"`).
    Sent,
    /// Terminal failure or attempt cap reached (`"R"`).
    ErrorProcessed,
    /// Administratively voided (`"A"`).
    Cancelled,
}

impl MessageStatus {
    /// One-character state code stored in the `state` column.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PendingSend => "P",
            Self::InProgress => "N",
            Self::Sent => "E",
            Self::ErrorProcessed => "R",
            Self::Cancelled => "A",
        }
    }

    /// Human-readable description, used in logs only.
    pub fn description(&self) -> &'static str {
        match self {
            Self::PendingSend => "pendiente de envío",
            Self::InProgress => "en proceso de envío",
            Self::Sent => "enviado",
            Self::ErrorProcessed => "procesado con error",
            Self::Cancelled => "anulado",
        }
    }

    /// Exact, total lookup by state code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "P" => Some(Self::PendingSend),
            "N" => Some(Self::InProgress),
            "E" => Some(Self::Sent),
            "R" => Some(Self::ErrorProcessed),
            "A" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Batch dispatch strategy. Config values keep the original spelling; an
/// unrecognized value falls back to the sequential mode with a warning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum SendMode {
    /// Every message as an independent worker task, no pacing.
    Paralelo,
    /// One pacing task submits one message per delay tick.
    ParaleloEspaciado,
    /// Submit, wait the delay, repeat; blocks the caller until done.
    #[default]
    SecuencialEspaciado,
    /// Same ordering as the blocking mode, composed as a deferred chain.
    SecuencialEspaciadoAsync,
}

impl SendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paralelo => "paralelo",
            Self::ParaleloEspaciado => "paralelo_espaciado",
            Self::SecuencialEspaciado => "secuencial_espaciado",
            Self::SecuencialEspaciadoAsync => "secuencial_espaciado_async",
        }
    }
}

impl From<String> for SendMode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "paralelo" => Self::Paralelo,
            "paralelo_espaciado" => Self::ParaleloEspaciado,
            "secuencial_espaciado" => Self::SecuencialEspaciado,
            "secuencial_espaciado_async" => Self::SecuencialEspaciadoAsync,
            other => {
                tracing::warn!(
                    modo = %other,
                    "modo de envío no reconocido, usando secuencial_espaciado"
                );
                Self::SecuencialEspaciado
            }
        }
    }
}
