use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::tap::TapError;

/// Why an LNURL withdraw request or callback was refused.
///
/// The variant decides what happened to the card's funds: everything up
/// to `InsufficientFunds` is rejected before a reservation exists,
/// `ExternalDefinite` has already unlocked the reservation and
/// `ExternalAmbiguous` deliberately leaves it locked.
#[derive(Debug, thiserror::Error)]
pub enum LnurlwError {
    #[error("{0}")]
    AuthFailure(String),

    #[error("{0}")]
    ValidationFailure(String),

    #[error("{0}")]
    InsufficientFunds(String),

    #[error("{reason}")]
    ExternalDefinite { card_payment_id: i64, reason: String },

    #[error("{reason}")]
    ExternalAmbiguous { card_payment_id: i64, reason: String },

    #[error("database error")]
    Store(#[from] sqlx::Error),
}

impl LnurlwError {
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::AuthFailure(reason.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailure(reason.into())
    }

    pub fn insufficient(reason: impl Into<String>) -> Self {
        Self::InsufficientFunds(reason.into())
    }

    /// Reason string sent back to the wallet.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<TapError> for LnurlwError {
    fn from(e: TapError) -> Self {
        Self::ValidationFailure(e.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct LnurlStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LnurlStatus {
    pub fn ok() -> Self {
        Self {
            status: "OK",
            reason: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: "ERROR",
            reason: Some(reason.into()),
        }
    }
}

// LNURL wallets expect errors in a 200 body.
impl IntoResponse for LnurlwError {
    fn into_response(self) -> Response {
        if let Self::Store(e) = &self {
            tracing::error!(error = %e, "store error while serving lnurlw request");
        }
        (StatusCode::OK, Json(LnurlStatus::error(self.reason()))).into_response()
    }
}

/// Errors from the token authenticated wallet API.
#[derive(Debug, thiserror::Error)]
pub enum WalletApiError {
    #[error("{0}")]
    BadAuth(String),

    #[error("{0}")]
    BadParam(String),

    #[error("{0}")]
    Backend(String),

    #[error("database error")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Serialize)]
struct WalletErrorBody {
    error: &'static str,
    code: u16,
    message: String,
}

impl WalletApiError {
    fn body(&self) -> WalletErrorBody {
        let (error, code) = match self {
            Self::BadAuth(_) => ("Bad auth", 1),
            Self::BadParam(_) => ("Bad param", 8),
            Self::Backend(_) | Self::Store(_) => ("Error", 999),
        };
        WalletErrorBody {
            error,
            code,
            message: self.to_string(),
        }
    }
}

impl IntoResponse for WalletApiError {
    fn into_response(self) -> Response {
        if let Self::Store(e) = &self {
            tracing::error!(error = %e, "store error while serving wallet api request");
        }
        (StatusCode::OK, Json(self.body())).into_response()
    }
}
