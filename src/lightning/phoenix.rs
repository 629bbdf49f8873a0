//! HTTP client for a phoenixd node.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::{path::Path, time::Duration};

use super::{BackendError, CreatedInvoice, IncomingPayment, PayInvoiceResponse, PaymentBackend};
use crate::config::Config;

pub struct PhoenixBackend {
    base_url: String,
    password: Option<String>,
    pay_timeout: Duration,
    lookup_timeout: Duration,
    http: Client,
}

impl PhoenixBackend {
    pub fn new(
        base_url: impl Into<String>,
        password: Option<String>,
        pay_timeout: Duration,
        lookup_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = Client::builder()
            .build()
            .map_err(|e| BackendError::RequestBuild(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            password,
            pay_timeout,
            lookup_timeout,
            http,
        })
    }

    /// A missing or unreadable password file does not stop start-up;
    /// every backend call then fails with `ConfigMissing`.
    pub fn from_config(config: &Config) -> Result<Self, BackendError> {
        let password = load_http_password(&config.phoenix_config);
        if password.is_none() {
            tracing::warn!(
                path = %config.phoenix_config.display(),
                "no phoenix http-password found, payments will fail until configured"
            );
        }

        Self::new(
            config.phoenix_url.clone(),
            password,
            Duration::from_secs(config.pay_timeout_secs),
            Duration::from_secs(config.lookup_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        timeout: Duration,
        endpoint: &str,
    ) -> Result<T, BackendError> {
        let password = self.password.as_deref().ok_or(BackendError::ConfigMissing)?;

        let response = request
            .basic_auth("", Some(password))
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::ResponseRead(e.to_string())
            }
        })?;

        if status != StatusCode::OK {
            tracing::warn!(endpoint, status = status.as_u16(), "phoenix call failed");
            return Err(BackendError::Status(status.as_u16()));
        }

        serde_json::from_slice(&body).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

fn classify_send_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else if e.is_builder() {
        BackendError::RequestBuild(e.to_string())
    } else if e.is_connect() {
        BackendError::Connect(e.to_string())
    } else {
        BackendError::Transport(e.to_string())
    }
}

/// Read `http-password` from a phoenix.conf style `key=value` file.
pub fn load_http_password(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    parse_http_password(&contents)
}

fn parse_http_password(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "http-password")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl PaymentBackend for PhoenixBackend {
    async fn pay_invoice(
        &self,
        amount_sat: u64,
        invoice: &str,
    ) -> Result<PayInvoiceResponse, BackendError> {
        let amount = amount_sat.to_string();
        let request = self
            .http
            .post(self.url("/payinvoice"))
            .form(&[("amountSat", amount.as_str()), ("invoice", invoice)]);

        self.send(request, self.pay_timeout, "payinvoice").await
    }

    async fn get_incoming_payment(
        &self,
        payment_hash: &str,
    ) -> Result<IncomingPayment, BackendError> {
        if !payment_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BackendError::RequestBuild("payment hash must be hex".to_string()));
        }

        let request = self
            .http
            .get(self.url(&format!("/payments/incoming/{payment_hash}")));

        self.send(request, self.lookup_timeout, "payments/incoming").await
    }

    async fn create_invoice(
        &self,
        amount_sat: u64,
        description: &str,
    ) -> Result<CreatedInvoice, BackendError> {
        let amount = amount_sat.to_string();
        let request = self.http.post(self.url("/createinvoice")).form(&[
            ("amountSat", amount.as_str()),
            ("description", description),
        ]);

        self.send(request, self.lookup_timeout, "createinvoice").await
    }
}
