use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};

use crate::{
    app_state::AppState,
    crypto::{random_hex, secrets_match},
    db::models::CardKeys,
    error::LnurlwError,
};

#[derive(Debug, Deserialize)]
pub struct NewCardQuery {
    #[serde(default)]
    a: String, // card issuance code
}

/// Bolt Card Programmer payload.
#[derive(Debug, Serialize)]
pub struct CardRegistrationResponse {
    pub protocol_name: &'static str,
    pub protocol_version: u32,
    pub card_name: &'static str,
    pub lnurlw_base: String,
    pub uid_privacy: &'static str,
    #[serde(flatten)]
    pub keys: CardKeys,
}

/// GET /new?a={new_card_code}
/// Creates a card with fresh keys for the programmer app to write.
pub async fn new_card(
    Query(params): Query<NewCardQuery>,
    State(state): State<AppState>,
) -> Result<Json<CardRegistrationResponse>, LnurlwError> {
    if params.a.is_empty() {
        return Err(LnurlwError::validation("a value not found"));
    }

    let Some(code) = state.config.new_card_code.as_deref() else {
        tracing::info!("card issuance requested but no issuance code is configured");
        return Err(LnurlwError::auth("a value not valid"));
    };
    if !secrets_match(&params.a, code) {
        return Err(LnurlwError::auth("a value not valid"));
    }

    let keys = CardKeys::generate();
    let card_id = state
        .store
        .insert_card(&keys, &random_hex(), &random_hex())
        .await?;
    tracing::info!(card_id, "card issued");

    Ok(Json(CardRegistrationResponse {
        protocol_name: "new_bolt_card_response",
        protocol_version: 1,
        card_name: "Spending_Card",
        lnurlw_base: state.config.lnurlw_base(),
        uid_privacy: "Y",
        keys,
    }))
}
