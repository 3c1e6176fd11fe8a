use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::broadcast;

use crate::ledger::{Ledger, LedgerError};
use crate::model::*;
use crate::notify::Notice;
use crate::observability::*;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("refund failed for payment {token}: {reason}")]
    Refund { token: String, reason: String },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Downstream consumer of lifecycle notices. Delivery is fire-and-forget:
/// a failure is logged and counted, never rolled back into the ledger.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notice: &Notice) -> Result<(), GatewayError>;
}

/// The external payment provider, as far as the ledger needs it.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Return the money for a payment whose slot was lost at confirmation.
    async fn refund(&self, token: &str, reason: &str) -> Result<(), GatewayError>;
}

/// A completed payment as delivered by the gateway (possibly more than once).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub token: String,
    pub spot_id: SpotId,
    pub principal: PrincipalId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attrs: ReservationAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Reserved(Reservation),
    /// The slot was taken first; a refund was requested.
    Refunded { conflicting: ReservationId },
}

/// Turn a payment confirmation into a reservation, or into a refund when the
/// slot was claimed while the payment was in flight. The refund call happens
/// after the ledger has released every lock.
pub async fn settle_payment(
    ledger: &Ledger,
    gateway: &dyn PaymentGateway,
    confirmation: PaymentConfirmation,
) -> Result<Settlement, LedgerError> {
    let result = ledger
        .confirm_deferred(
            &confirmation.token,
            confirmation.spot_id,
            confirmation.principal,
            confirmation.start,
            confirmation.end,
            confirmation.attrs,
        )
        .await;

    match result {
        Ok(reservation) => Ok(Settlement::Reserved(reservation)),
        Err(LedgerError::Conflict(conflicting)) => {
            metrics::counter!(REFUNDS_REQUESTED_TOTAL).increment(1);
            let reason = format!("spot {} already reserved", confirmation.spot_id);
            if let Err(e) = gateway.refund(&confirmation.token, &reason).await {
                // Confirmations are redelivered; the retry asks again.
                tracing::error!("{e}");
            } else {
                tracing::info!("refund requested for payment {}", confirmation.token);
            }
            Ok(Settlement::Refunded { conflicting })
        }
        Err(e) => Err(e),
    }
}

/// Writes each notice as one JSON line to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, notice: &Notice) -> Result<(), GatewayError> {
        tracing::info!(target: "parkledger::notice", "{}", notice.to_json()?);
        Ok(())
    }
}

/// Fan every notice from the hub out to all sinks. Returns when the hub is dropped.
pub async fn run_dispatcher(mut rx: broadcast::Receiver<Notice>, sinks: Vec<Arc<dyn NotificationSink>>) {
    loop {
        let notice = match rx.recv().await {
            Ok(notice) => notice,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("notification dispatcher lagged, {n} notices dropped");
                metrics::counter!(NOTIFY_FAILURES_TOTAL, "sink" => "dispatcher").increment(n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let results = join_all(sinks.iter().map(|sink| sink.deliver(&notice))).await;
        for (sink, result) in sinks.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("sink {} failed to deliver {} notice: {e}", sink.name(), notice.label());
                metrics::counter!(NOTIFY_FAILURES_TOTAL, "sink" => sink.name().to_string()).increment(1);
            }
        }
    }
    tracing::info!("notification dispatcher stopped");
}
