use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

use crate::{
    app_state::AppState,
    error::{LnurlStatus, LnurlwError},
    withdraw::WithdrawRequest,
};

#[derive(Debug, Deserialize)]
pub struct LnurlwParams {
    #[serde(default)]
    p: String, // encrypted UID + counter
    #[serde(default)]
    c: String, // truncated CMAC
}

/// GET /ln?p={encrypted}&c={cmac}
pub async fn lnurlw_request(
    Query(params): Query<LnurlwParams>,
    State(state): State<AppState>,
) -> Result<Json<WithdrawRequest>, LnurlwError> {
    let request = state
        .withdraw_session()
        .begin_withdraw(&params.p, &params.c)
        .await?;

    Ok(Json(request))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    k1: String,
    #[serde(default)]
    pr: String, // Lightning invoice
    pin: Option<String>,
}

/// GET /cb?k1={k1}&pr={invoice}[&pin={pin}]
///
/// Runs on its own task: once funds are reserved the payment must reach
/// a reconciled state even if the wallet hangs up.
pub async fn lnurlw_callback(
    Query(params): Query<CallbackParams>,
    State(state): State<AppState>,
) -> Result<Json<LnurlStatus>, LnurlwError> {
    let orchestrator = state.payment_orchestrator();

    let task = tokio::spawn(async move {
        orchestrator
            .process_callback(&params.k1, &params.pr, params.pin.as_deref())
            .await
    });

    match task.await {
        Ok(result) => result.map(|_| Json(LnurlStatus::ok())),
        Err(e) => {
            tracing::error!(error = %e, "withdraw callback task failed");
            Err(LnurlwError::validation("internal error"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{CardUid, Counter, test_support::forge_tap},
        db::ledger::test_support::{fund, store_with_card},
        lightning::test_support::{ScriptedBackend, signed_invoice},
    };
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
        routing::get,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/ln", get(lnurlw_request))
            .route("/cb", get(lnurlw_callback))
            .with_state(state)
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn tap_then_bad_invoice_over_http() {
        let (store, card_id, keys) = store_with_card().await;
        let state = AppState::for_tests(store.clone(), Arc::new(ScriptedBackend::default()));

        let uid = CardUid::from_hex("04996c6a926980").unwrap();
        let (p, c) = forge_tap(&keys.k1, &keys.k2, &uid, Counter::new(1));
        let uri = format!("/ln?p={}&c={}", hex::encode(p), hex::encode(c));

        let body = get_json(router(state.clone()), &uri).await;
        assert_eq!(body["tag"], "withdrawRequest");
        assert_eq!(body["callback"], "https://cards.test/cb");
        let k1 = body["k1"].as_str().unwrap().to_string();
        assert_eq!(store.card_counter(card_id).await.unwrap(), Some(1));

        let body = get_json(router(state.clone()), &uri).await;
        assert_eq!(body["status"], "ERROR");
        assert_eq!(body["reason"], "card counter not incremented");

        let body = get_json(router(state), &format!("/cb?k1={k1}&pr=notaninvoice")).await;
        assert_eq!(body["status"], "ERROR");
        assert_eq!(body["reason"], "failed to decode payment request");
    }

    #[tokio::test]
    async fn tap_then_pay_over_http() {
        let (store, card_id, keys) = store_with_card().await;
        fund(&store, card_id, 5_000).await;
        let backend = Arc::new(ScriptedBackend::succeeding_with_fee(4));
        let state = AppState::for_tests(store.clone(), backend.clone());

        let uid = CardUid::from_hex("04996c6a926980").unwrap();
        let (p, c) = forge_tap(&keys.k1, &keys.k2, &uid, Counter::new(1));
        let body = get_json(
            router(state.clone()),
            &format!("/ln?p={}&c={}", hex::encode(p), hex::encode(c)),
        )
        .await;
        let k1 = body["k1"].as_str().unwrap().to_string();

        let pr = signed_invoice(1_200);
        let body = get_json(router(state), &format!("/cb?k1={k1}&pr={pr}")).await;
        assert_eq!(body, serde_json::json!({ "status": "OK" }));

        let payments = store.payments(card_id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount_sats, 1_200);
        assert_eq!(payments[0].fee_sats, 4);
        assert_eq!(store.balance(card_id).await.unwrap(), 3_796);
        assert_eq!(backend.pay_call_count(), 1);
    }

    #[tokio::test]
    async fn missing_params_are_lnurl_errors() {
        let (store, _, _) = store_with_card().await;
        let state = AppState::for_tests(store, Arc::new(ScriptedBackend::default()));

        let body = get_json(router(state.clone()), "/ln").await;
        assert_eq!(body["reason"], "badly formatted request");

        let body = get_json(router(state), "/cb").await;
        assert_eq!(body["reason"], "k1 not found");
    }
}
