//! LndHub-style wallet API for the card holder's app.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, Query, State},
    http::{header::AUTHORIZATION, request::Parts},
    routing::{get, post},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    app_state::AppState,
    crypto::{random_hex, secrets_match},
    db::models::{CardKeys, CardLimits},
    error::WalletApiError,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/create", post(create_account))
        .route("/auth", post(auth))
        .route("/balance", get(balance))
        .route("/addinvoice", post(add_invoice))
        .route("/getuserinvoices", get(get_user_invoices))
        .route("/gettxs", get(get_txs))
        .route("/getcard", post(get_card))
        .route("/getcardkeys", post(get_card_keys))
        .route("/updatecardwithpin", post(update_card))
        .route("/wipecard", post(wipe_card))
}

/// Card behind the request's `Authorization: Bearer` access token.
pub struct CardAuth(pub i64);

impl FromRequestParts<AppState> for CardAuth {
    type Rejection = WalletApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| WalletApiError::BadAuth("missing or invalid Authorization header".into()))?;

        state
            .store
            .card_id_for_access_token(token.trim())
            .await?
            .map(CardAuth)
            .ok_or_else(|| WalletApiError::BadAuth("no card found for access token".into()))
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8], err: WalletApiError) -> Result<T, WalletApiError> {
    serde_json::from_slice(body).map_err(|_| err)
}

/// Wallets send numbers and booleans either bare or quoted.
fn int_param(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag_param(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_negative(value: &Value, name: &str) -> Result<i64, WalletApiError> {
    int_param(value)
        .filter(|v| *v >= 0)
        .ok_or_else(|| WalletApiError::BadParam(format!("bad parameter passed in - {name}")))
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    #[serde(default)]
    invite_secret: String,
}

#[derive(Debug, Serialize)]
pub struct CreateAccountResponse {
    pub login: String,
    pub password: String,
}

/// POST /create
pub async fn create_account(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CreateAccountResponse>, WalletApiError> {
    let request: CreateAccountRequest =
        parse_body(&body, WalletApiError::BadParam("invalid request body".into()))?;

    let allowed = state
        .config
        .invite_secret
        .as_deref()
        .is_some_and(|secret| secrets_match(&request.invite_secret, secret));
    if !allowed {
        return Err(WalletApiError::BadAuth("incorrect invite_secret".into()));
    }

    let login = random_hex();
    let password = random_hex();
    let card_id = state
        .store
        .insert_card(&CardKeys::generate(), &login, &password)
        .await?;
    tracing::info!(card_id, "wallet account created");

    Ok(Json(CreateAccountResponse { login, password }))
}

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct AuthRequest {
    #[serde(default)]
    login: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    refresh_token: String,
}

/// POST /auth?type=auth|refresh_token
pub async fn auth(
    Query(query): Query<AuthQuery>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TokenPair>, WalletApiError> {
    let tokens = TokenPair {
        access_token: random_hex(),
        refresh_token: random_hex(),
    };

    match query.kind.as_str() {
        "refresh_token" => {
            let request: AuthRequest =
                parse_body(&body, WalletApiError::BadAuth("bad format for refresh_token".into()))?;
            let rotated = state
                .store
                .rotate_tokens(&request.refresh_token, &tokens.refresh_token, &tokens.access_token)
                .await?;
            if !rotated {
                return Err(WalletApiError::BadAuth("invalid refresh_token".into()));
            }
        }
        "auth" => {
            let request: AuthRequest = parse_body(
                &body,
                WalletApiError::BadAuth("bad format for login and password".into()),
            )?;
            let issued = state
                .store
                .set_tokens_from_credentials(
                    &request.login,
                    &request.password,
                    &tokens.access_token,
                    &tokens.refresh_token,
                )
                .await?;
            if !issued {
                return Err(WalletApiError::BadAuth("invalid login and password".into()));
            }
        }
        _ => return Err(WalletApiError::BadAuth("auth parameters not valid".into())),
    }

    Ok(Json(tokens))
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    #[serde(rename = "BTC")]
    pub btc: AvailableBalance,
}

#[derive(Debug, Serialize)]
pub struct AvailableBalance {
    #[serde(rename = "AvailableBalance")]
    pub available_balance: i64,
}

/// GET /balance
pub async fn balance(
    CardAuth(card_id): CardAuth,
    State(state): State<AppState>,
) -> Result<Json<BalanceResponse>, WalletApiError> {
    let available_balance = state.store.balance(card_id).await?;

    Ok(Json(BalanceResponse {
        btc: AvailableBalance { available_balance },
    }))
}

/// Payment hash as LndHub clients expect it: a node.js Buffer dump.
#[derive(Debug, Serialize)]
pub struct RHash {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: Vec<u8>,
}

impl RHash {
    fn from_hex(hash: &str) -> Self {
        Self {
            kind: "buffer",
            data: hex::decode(hash).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddInvoiceRequest {
    #[serde(default)]
    amt: Value,
    #[serde(default)]
    memo: String,
}

#[derive(Debug, Serialize)]
pub struct AddInvoiceResponse {
    pub pay_req: String,
    pub payment_request: String,
    pub add_index: String,
    pub r_hash: RHash,
    pub hash: String,
}

/// POST /addinvoice
pub async fn add_invoice(
    CardAuth(card_id): CardAuth,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AddInvoiceResponse>, WalletApiError> {
    let request: AddInvoiceRequest =
        parse_body(&body, WalletApiError::BadParam("invalid request body".into()))?;
    let amount_sats = int_param(&request.amt)
        .ok_or_else(|| WalletApiError::BadParam("invalid amount".into()))?;
    if amount_sats <= 0 {
        return Err(WalletApiError::BadParam("amount must be positive".into()));
    }

    let created = state
        .backend
        .create_invoice(amount_sats as u64, &request.memo)
        .await
        .map_err(|e| {
            tracing::error!(card_id, error = %e, "failed to create invoice");
            WalletApiError::Backend("failed to create invoice".into())
        })?;

    let receipt_id = state
        .store
        .add_receipt(card_id, &created.serialized, &created.payment_hash, amount_sats)
        .await?;
    tracing::info!(card_id, receipt_id, amount_sats, "invoice created for card funding");

    Ok(Json(AddInvoiceResponse {
        pay_req: created.serialized.clone(),
        payment_request: created.serialized,
        add_index: receipt_id.to_string(),
        r_hash: RHash::from_hex(&created.payment_hash),
        hash: created.payment_hash,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InvoicesQuery {
    limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserInvoice {
    pub r_hash: RHash,
    pub payment_request: String,
    pub add_index: String,
    pub pay_req: String,
    pub description: String,
    pub payment_hash: String,
    pub ispaid: bool,
    pub amt: i64,
    pub expire_time: i64,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// GET /getuserinvoices[?limit=n]
///
/// Unpaid receipts are checked against the node and marked paid when it
/// has received them; lookup failures leave them unpaid for now.
pub async fn get_user_invoices(
    CardAuth(card_id): CardAuth,
    Query(query): Query<InvoicesQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<UserInvoice>>, WalletApiError> {
    let limit = query.limit.and_then(|l| l.trim().parse::<i64>().ok());
    let receipts = state.store.receipts(card_id, limit).await?;

    let mut invoices = Vec::with_capacity(receipts.len());
    for receipt in receipts {
        let mut paid = receipt.is_paid();
        if !paid {
            match state.backend.get_incoming_payment(&receipt.r_hash_hex).await {
                Ok(incoming) if incoming.is_paid => {
                    paid = state.store.mark_receipt_paid(&receipt.r_hash_hex).await?;
                    tracing::info!(card_id, receipt_id = receipt.card_receipt_id, "receipt paid");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(card_id, receipt_id = receipt.card_receipt_id, error = %e, "could not refresh receipt");
                }
            }
        }

        invoices.push(UserInvoice {
            r_hash: RHash::from_hex(&receipt.r_hash_hex),
            payment_request: receipt.ln_invoice.clone(),
            add_index: receipt.card_receipt_id.to_string(),
            pay_req: receipt.ln_invoice,
            description: String::new(),
            payment_hash: receipt.r_hash_hex,
            ispaid: paid,
            amt: receipt.amount_sats,
            expire_time: receipt.expire_time,
            timestamp: receipt.timestamp,
            kind: "user_invoice",
        });
    }

    Ok(Json(invoices))
}

#[derive(Debug, Serialize)]
pub struct Transaction {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub fee: i64,
    pub value: i64,
    pub timestamp: String,
    pub memo: String,
}

/// GET /gettxs
///
/// Outgoing card payments, newest first. Payments whose funds were
/// unlocked after a refused attempt never left the card and are omitted.
pub async fn get_txs(
    CardAuth(card_id): CardAuth,
    State(state): State<AppState>,
) -> Result<Json<Vec<Transaction>>, WalletApiError> {
    let txs = state
        .store
        .payments(card_id)
        .await?
        .into_iter()
        .filter(|payment| payment.is_paid())
        .map(|payment| Transaction {
            kind: "paid_invoice",
            fee: payment.fee_sats,
            value: payment.amount_sats,
            timestamp: payment.timestamp.to_string(),
            memo: String::new(),
        })
        .collect();

    Ok(Json(txs))
}

#[derive(Debug, Serialize)]
pub struct CardResponse {
    pub status: &'static str,
    pub uid: String,
    pub lnurlw_enable: String,
    pub tx_limit_sats: String,
    pub day_limit_sats: String,
    pub pin_enable: String,
    pub pin_limit_sats: String,
}

/// POST /getcard
pub async fn get_card(
    CardAuth(card_id): CardAuth,
    State(state): State<AppState>,
) -> Result<Json<CardResponse>, WalletApiError> {
    let card = state
        .store
        .card(card_id)
        .await?
        .ok_or_else(|| WalletApiError::BadAuth("no card found for access token".into()))?;

    Ok(Json(CardResponse {
        status: "OK",
        uid: card.uid,
        lnurlw_enable: card.lnurlw_enable,
        tx_limit_sats: card.tx_limit_sats.to_string(),
        day_limit_sats: card.day_limit_sats.to_string(),
        pin_enable: card.pin_enable,
        pin_limit_sats: card.pin_limit_sats.to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct CardKeysResponse {
    pub protocol_name: &'static str,
    pub protocol_version: u32,
    pub card_name: &'static str,
    pub lnurlw_base: String,
    pub uid_privacy: &'static str,
    #[serde(flatten)]
    pub keys: CardKeys,
}

/// POST /getcardkeys
/// Replaces all five keys; the card must be reprogrammed with the result.
pub async fn get_card_keys(
    CardAuth(card_id): CardAuth,
    State(state): State<AppState>,
) -> Result<Json<CardKeysResponse>, WalletApiError> {
    let keys = CardKeys::generate();
    if !state.store.set_card_keys(card_id, &keys).await? {
        return Err(WalletApiError::BadAuth("no card found for access token".into()));
    }
    tracing::info!(card_id, "card keys rotated");

    Ok(Json(CardKeysResponse {
        protocol_name: "create_bolt_card_response",
        protocol_version: 2,
        card_name: "card",
        lnurlw_base: state.config.lnurlw_base(),
        uid_privacy: "N",
        keys,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateCardRequest {
    enable: Value,
    tx_max: Value,
    day_max: Value,
    enable_pin: Value,
    pin_limit_sats: Value,
    card_pin_number: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

/// POST /updatecardwithpin
pub async fn update_card(
    CardAuth(card_id): CardAuth,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<StatusResponse>, WalletApiError> {
    let request: UpdateCardRequest = parse_body(
        &body,
        WalletApiError::BadParam("bad parameter passed in - decode".into()),
    )?;

    let limits = CardLimits {
        enabled: flag_param(&request.enable)
            .ok_or_else(|| WalletApiError::BadParam("bad parameter passed in - enable".into()))?,
        tx_limit_sats: non_negative(&request.tx_max, "tx_limit_sats")?,
        day_limit_sats: non_negative(&request.day_max, "day_limit_sats")?,
        pin_enable: flag_param(&request.enable_pin).unwrap_or(false),
        pin_number: request
            .card_pin_number
            .map(|pin| pin.trim().to_string())
            .filter(|pin| !pin.is_empty()),
        pin_limit_sats: non_negative(&request.pin_limit_sats, "pin_limit_sats")?,
    };

    if !state.store.update_card_limits(card_id, &limits).await? {
        return Err(WalletApiError::BadAuth("no card found for access token".into()));
    }
    tracing::info!(card_id, enabled = limits.enabled, pin_enable = limits.pin_enable, "card settings updated");

    Ok(Json(StatusResponse { status: "OK" }))
}

/// Bolt Card Programmer wipe payload.
#[derive(Debug, Serialize)]
pub struct WipeCardResponse {
    pub status: &'static str,
    pub action: &'static str,
    pub version: u32,
    #[serde(flatten)]
    pub keys: CardKeys,
}

/// POST /wipecard
pub async fn wipe_card(
    CardAuth(card_id): CardAuth,
    State(state): State<AppState>,
) -> Result<Json<WipeCardResponse>, WalletApiError> {
    let keys = state
        .store
        .wipe_card(card_id)
        .await?
        .ok_or_else(|| WalletApiError::BadAuth("no card found for access token".into()))?;
    tracing::info!(card_id, "card wiped");

    Ok(Json(WipeCardResponse {
        status: "OK",
        action: "wipe",
        version: 1,
        keys,
    }))
}
