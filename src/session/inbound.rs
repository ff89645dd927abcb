//! Inbound deliver_sm processing: mobile-originated messages and delivery
//! receipts.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::store::SharedStore;
use crate::wire::{DeliverSm, ESM_CLASS_DELIVERY_RECEIPT, STATUS_OK};

/// Invoked by the session actor for every inbound deliver_sm. The returned
/// value is the command_status of the deliver_sm_resp.
#[async_trait]
pub trait DeliverHandler: Send + Sync {
    async fn on_deliver(&self, deliver: &DeliverSm) -> u32;
}

/// Routes inbound PDUs for one carrier service: receipts are parsed and
/// logged, mobile-originated messages are persisted.
pub struct InboundHandler {
    service: String,
    store: SharedStore,
}

impl InboundHandler {
    pub fn new(service: impl Into<String>, store: SharedStore) -> Self {
        Self {
            service: service.into(),
            store,
        }
    }

    async fn handle_mobile_originated(&self, deliver: &DeliverSm) {
        let text = String::from_utf8_lossy(&deliver.short_message);

        info!(
            service = %self.service,
            origen = %deliver.source_addr,
            destino = %deliver.dest_addr,
            texto = %text,
            "MO recibido"
        );

        self.store
            .save_received_message(&deliver.source_addr, &deliver.dest_addr, &text)
            .await;
    }

    fn handle_delivery_receipt(&self, deliver: &DeliverSm) {
        let receipt = String::from_utf8_lossy(&deliver.short_message);
        debug!(service = %self.service, recibo = %receipt, "DLR recibido");

        let message_id = extract_value(&receipt, "id");
        let status = extract_value(&receipt, "stat");

        // Receipt state is not correlated back to the outbound row.
        info!(
            service = %self.service,
            id_mensaje = %message_id,
            estado_entrega = %status,
            "acuse de entrega"
        );
    }
}

#[async_trait]
impl DeliverHandler for InboundHandler {
    async fn on_deliver(&self, deliver: &DeliverSm) -> u32 {
        let is_receipt =
            deliver.esm_class & ESM_CLASS_DELIVERY_RECEIPT == ESM_CLASS_DELIVERY_RECEIPT;

        if is_receipt {
            self.handle_delivery_receipt(deliver);
        } else {
            self.handle_mobile_originated(deliver).await;
        }

        STATUS_OK
    }
}

/// Extract the value of a `key:value` token from a whitespace-separated DLR
/// body. Missing keys yield an empty string.
fn extract_value<'a>(text: &'a str, key: &str) -> &'a str {
    for part in text.split_whitespace() {
        if let Some(rest) = part.strip_prefix(key) {
            if let Some(value) = rest.strip_prefix(':') {
                return value;
            }
        }
    }
    ""
}
