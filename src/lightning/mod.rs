pub mod phoenix;

use async_trait::async_trait;
use lightning_invoice::Bolt11Invoice;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

pub use phoenix::PhoenixBackend;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvoiceError {
    #[error("invalid invoice: {0}")]
    Parse(String),
    #[error("invoice must have an amount")]
    MissingAmount,
}

/// Newtype wrapper around Bolt11Invoice for convenience methods
#[derive(Debug, Clone)]
pub struct Invoice(Bolt11Invoice);

impl FromStr for Invoice {
    type Err = InvoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bolt11Invoice::from_str(s.trim())
            .map(Self)
            .map_err(|e| InvoiceError::Parse(e.to_string()))
    }
}

impl Invoice {
    pub fn amount_msats(&self) -> Result<u64, InvoiceError> {
        self.0
            .amount_milli_satoshis()
            .ok_or(InvoiceError::MissingAmount)
    }

    /// Whole sats; sub-sat remainders are dropped.
    pub fn amount_sats(&self) -> Result<u64, InvoiceError> {
        Ok(self.amount_msats()? / 1000)
    }

    pub fn payment_hash(&self) -> String {
        hex::encode(self.0.payment_hash().as_ref() as &[u8])
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_expired()
    }
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What must happen to a reservation after a failed payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundsDisposition {
    /// The payment certainly did not go out; release the reservation.
    Unlock,
    /// The payment may have gone out; an operator has to reconcile it.
    KeepLocked,
}

/// Failure of the call to the payment backend itself.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("payment backend credentials not configured")]
    ConfigMissing,
    #[error("failed to build backend request: {0}")]
    RequestBuild(String),
    #[error("could not connect to payment backend: {0}")]
    Connect(String),
    #[error("payment backend timed out")]
    Timeout,
    #[error("payment backend transport error: {0}")]
    Transport(String),
    #[error("failed to read backend response: {0}")]
    ResponseRead(String),
    #[error("payment backend returned status {0}")]
    Status(u16),
    #[error("failed to decode backend response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn disposition(&self) -> FundsDisposition {
        match self {
            Self::ConfigMissing
            | Self::RequestBuild(_)
            | Self::Connect(_)
            | Self::ResponseRead(_) => FundsDisposition::Unlock,
            Self::Timeout | Self::Transport(_) | Self::Status(_) | Self::Decode(_) => {
                FundsDisposition::KeepLocked
            }
        }
    }

    /// Short reason for the wallet.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ConfigMissing => "payment backend not configured",
            Self::RequestBuild(_) | Self::Connect(_) => "request creation failed",
            Self::Timeout => "payment backend timeout",
            Self::Transport(_) => "payment backend transport failure",
            Self::ResponseRead(_) => "payment backend response unreadable",
            Self::Status(_) => "payment backend status fail",
            Self::Decode(_) => "payment backend decode failed",
        }
    }
}

/// Reason the backend gives for not completing a payment it accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentReason {
    None,
    AlreadyPaid,
    RecipientRejected,
    InsufficientBackendFunds,
    NoRoute,
    Unrecognized(String),
}

impl PaymentReason {
    pub fn from_backend(reason: Option<&str>) -> Self {
        match reason.map(str::trim) {
            None | Some("") => Self::None,
            Some("this invoice has already been paid") => Self::AlreadyPaid,
            Some("recipient node rejected the payment") => Self::RecipientRejected,
            Some("not enough funds in wallet to afford payment") => Self::InsufficientBackendFunds,
            Some("routing fees are insufficient") => Self::NoRoute,
            Some(other) => Self::Unrecognized(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PayInvoiceResponse {
    pub recipient_amount_sat: i64,
    pub routing_fee_sat: i64,
    pub payment_id: String,
    pub payment_hash: String,
    pub payment_preimage: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IncomingPayment {
    pub payment_hash: String,
    pub preimage: String,
    pub external_id: String,
    pub description: String,
    pub invoice: String,
    pub is_paid: bool,
    pub received_sat: i64,
    pub fees: i64,
    pub completed_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreatedInvoice {
    pub amount_sat: i64,
    pub payment_hash: String,
    pub serialized: String,
}

/// The Lightning node that holds the custodial funds.
#[async_trait]
pub trait PaymentBackend: Send + Sync {
    /// Pay a Bolt11 invoice. Never retried by callers.
    async fn pay_invoice(
        &self,
        amount_sat: u64,
        invoice: &str,
    ) -> Result<PayInvoiceResponse, BackendError>;

    async fn get_incoming_payment(&self, payment_hash: &str)
    -> Result<IncomingPayment, BackendError>;

    async fn create_invoice(
        &self,
        amount_sat: u64,
        description: &str,
    ) -> Result<CreatedInvoice, BackendError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_reasons_map_to_variants() {
        assert_eq!(PaymentReason::from_backend(None), PaymentReason::None);
        assert_eq!(PaymentReason::from_backend(Some("")), PaymentReason::None);
        assert_eq!(
            PaymentReason::from_backend(Some("this invoice has already been paid")),
            PaymentReason::AlreadyPaid
        );
        assert_eq!(
            PaymentReason::from_backend(Some("not enough funds in wallet to afford payment")),
            PaymentReason::InsufficientBackendFunds
        );
        assert_eq!(
            PaymentReason::from_backend(Some("routing fees are insufficient")),
            PaymentReason::NoRoute
        );
        assert_eq!(
            PaymentReason::from_backend(Some("something new")),
            PaymentReason::Unrecognized("something new".to_string())
        );
    }

    #[test]
    fn ambiguous_transport_failures_keep_funds_locked() {
        for err in [
            BackendError::Timeout,
            BackendError::Status(500),
            BackendError::Decode("eof".into()),
            BackendError::Transport("reset".into()),
        ] {
            assert_eq!(err.disposition(), FundsDisposition::KeepLocked, "{err}");
        }
        for err in [
            BackendError::ConfigMissing,
            BackendError::RequestBuild("bad".into()),
            BackendError::Connect("refused".into()),
            BackendError::ResponseRead("eof".into()),
        ] {
            assert_eq!(err.disposition(), FundsDisposition::Unlock, "{err}");
        }
    }

    #[test]
    fn pay_response_tolerates_missing_fields() {
        let parsed: PayInvoiceResponse =
            serde_json::from_str(r#"{"reason":"routing fees are insufficient"}"#).unwrap();
        assert_eq!(parsed.routing_fee_sat, 0);
        assert_eq!(parsed.reason.as_deref(), Some("routing fees are insufficient"));

        let parsed: PayInvoiceResponse = serde_json::from_str(
            r#"{"recipientAmountSat":200,"routingFeeSat":3,"paymentId":"id","paymentHash":"ab","paymentPreimage":"cd"}"#,
        )
        .unwrap();
        assert_eq!(parsed.routing_fee_sat, 3);
        assert!(parsed.reason.is_none());
    }

    #[test]
    fn signed_invoice_decodes_to_its_amount() {
        let invoice: Invoice = test_support::signed_invoice(250).parse().unwrap();
        assert_eq!(invoice.amount_sats().unwrap(), 250);
        assert_eq!(invoice.amount_msats().unwrap(), 250_000);
        assert!(!invoice.is_expired());
        assert_eq!(invoice.payment_hash().len(), 64);
    }

    #[test]
    fn garbage_invoice_is_rejected() {
        assert!(matches!(
            "not-an-invoice".parse::<Invoice>(),
            Err(InvoiceError::Parse(_))
        ));
    }
}
