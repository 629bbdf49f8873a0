//! First leg of LNURL-withdraw: an authenticated tap is exchanged for a
//! short-lived k1 challenge the wallet must present on the callback.

use serde::Serialize;
use std::sync::Arc;

use crate::{
    config::Config,
    crypto::{Counter, random_hex},
    db::{LedgerStore, models::WithdrawChallenge},
    error::LnurlwError,
    tap::{TapParams, TapVerifier},
};

const DEFAULT_DESCRIPTION: &str = "Bolt Card payment";

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    pub tag: &'static str,
    pub callback: String,
    pub k1: String,
    pub default_description: String,
    pub min_withdrawable: u64,
    pub max_withdrawable: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_limit: Option<u64>,
}

#[derive(Clone)]
pub struct WithdrawSession {
    store: LedgerStore,
    config: Arc<Config>,
}

impl WithdrawSession {
    pub fn new(store: LedgerStore, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Bind a fresh k1 to the card, replacing any earlier one.
    pub async fn issue_challenge(&self, card_id: i64) -> Result<(String, i64), LnurlwError> {
        let k1 = random_hex();
        let expiry = now() + self.config.k1_expiry_secs;

        if !self.store.set_withdraw_challenge(card_id, &k1, expiry).await? {
            return Err(LnurlwError::auth("card not found"));
        }

        Ok((k1, expiry))
    }

    /// Card and expiry for `k1`, without judging the expiry.
    pub async fn validate_challenge(
        &self,
        k1: &str,
    ) -> Result<Option<WithdrawChallenge>, LnurlwError> {
        Ok(self.store.withdraw_challenge(k1).await?)
    }

    /// Like `validate_challenge`, but an unknown or expired k1 is an error.
    pub async fn live_challenge(&self, k1: &str) -> Result<WithdrawChallenge, LnurlwError> {
        let challenge = self
            .validate_challenge(k1)
            .await?
            .ok_or_else(|| LnurlwError::auth("k1 not found"))?;

        if now() > challenge.expiry {
            tracing::debug!(card_id = challenge.card_id, "k1 presented after expiry");
            return Err(LnurlwError::auth("k1 expired"));
        }

        Ok(challenge)
    }

    /// Handle `GET /ln?p=..&c=..`.
    ///
    /// Nothing is written unless the tap authenticates, the card is
    /// enabled and the tap counter moved past the stored one.
    pub async fn begin_withdraw(
        &self,
        p_hex: &str,
        c_hex: &str,
    ) -> Result<WithdrawRequest, LnurlwError> {
        let tap = TapParams::from_hex(p_hex, c_hex)?;

        let found = TapVerifier::new(&self.store)
            .find_card(&tap)
            .await?
            .ok_or_else(|| {
                tracing::debug!("tap matched no card");
                LnurlwError::auth("card not found")
            })?;

        let card = self
            .store
            .card(found.card_id)
            .await?
            .ok_or_else(|| LnurlwError::auth("card not found"))?;

        if !card.is_enabled() {
            tracing::info!(card_id = card.card_id, "tap on disabled card");
            return Err(LnurlwError::auth("card is disabled"));
        }

        let stored = Counter::new(u32::try_from(card.last_counter_value).unwrap_or(Counter::MAX));
        let presented = i64::from(found.counter.value());
        if found.counter <= stored {
            if stored.is_exhausted() {
                tracing::warn!(card_id = card.card_id, "tap counter exhausted, card needs re-issue");
                return Err(LnurlwError::auth("card counter exhausted"));
            }
            tracing::warn!(
                card_id = card.card_id,
                presented,
                stored = card.last_counter_value,
                "tap counter not incremented"
            );
            return Err(LnurlwError::auth("card counter not incremented"));
        }

        // a concurrent replay of this tap may have won the race
        if !self.store.advance_counter(card.card_id, presented).await? {
            return Err(LnurlwError::auth("card counter not incremented"));
        }
        self.store
            .record_card_uid(card.card_id, &found.uid.to_string())
            .await?;

        let (k1, _) = self.issue_challenge(card.card_id).await?;
        tracing::info!(card_id = card.card_id, counter = presented, "withdraw challenge issued");

        Ok(WithdrawRequest {
            tag: "withdrawRequest",
            callback: self.config.callback_url(),
            k1,
            default_description: DEFAULT_DESCRIPTION.to_string(),
            min_withdrawable: self.config.min_withdraw_sats * 1000,
            max_withdrawable: self.config.max_withdraw_sats * 1000,
            pin_limit: card
                .pin_required()
                .then(|| card.pin_limit_sats.max(0) as u64 * 1000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{CardUid, test_support::forge_tap},
        db::{
            ledger::test_support::store_with_card,
            models::{CardKeys, CardLimits},
        },
    };

    fn tap_hex(keys: &CardKeys, counter: u32) -> (String, String) {
        let uid = CardUid::from_hex("04996c6a926980").unwrap();
        let (p, c) = forge_tap(&keys.k1, &keys.k2, &uid, Counter::new(counter));
        (hex::encode_upper(p), hex::encode_upper(c))
    }

    async fn session() -> (WithdrawSession, LedgerStore, i64, CardKeys) {
        let (store, card_id, keys) = store_with_card().await;
        let session = WithdrawSession::new(store.clone(), Arc::new(Config::for_tests()));
        (session, store, card_id, keys)
    }

    fn auth_reason(err: LnurlwError) -> String {
        match err {
            LnurlwError::AuthFailure(reason) => reason,
            other => panic!("expected auth failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_tap_advances_counter_and_issues_k1() {
        let (session, store, card_id, keys) = session().await;
        store.advance_counter(card_id, 5).await.unwrap();

        let (p, c) = tap_hex(&keys, 6);
        let before = now();
        let request = session.begin_withdraw(&p, &c).await.unwrap();

        assert_eq!(store.card_counter(card_id).await.unwrap(), Some(6));
        assert_eq!(request.tag, "withdrawRequest");
        assert_eq!(request.callback, "https://cards.test/cb");
        assert_eq!(request.min_withdrawable, 1_000);
        assert_eq!(request.max_withdrawable, 1_000_000_000);
        assert_eq!(request.pin_limit, None);

        let challenge = store.withdraw_challenge(&request.k1).await.unwrap().unwrap();
        assert_eq!(challenge.card_id, card_id);
        assert!(challenge.expiry >= before + 10 && challenge.expiry <= now() + 10);

        let card = store.card(card_id).await.unwrap().unwrap();
        assert_eq!(card.uid, "04996c6a926980");
    }

    #[tokio::test]
    async fn replayed_tap_is_rejected_without_mutation() {
        let (session, store, card_id, keys) = session().await;
        store.advance_counter(card_id, 5).await.unwrap();

        let (p, c) = tap_hex(&keys, 6);
        let first = session.begin_withdraw(&p, &c).await.unwrap();

        let err = session.begin_withdraw(&p, &c).await.unwrap_err();
        assert_eq!(auth_reason(err), "card counter not incremented");
        assert_eq!(store.card_counter(card_id).await.unwrap(), Some(6));
        assert!(store.withdraw_challenge(&first.k1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn older_counter_is_rejected() {
        let (session, store, card_id, keys) = session().await;
        store.advance_counter(card_id, 9).await.unwrap();

        let (p, c) = tap_hex(&keys, 3);
        let err = session.begin_withdraw(&p, &c).await.unwrap_err();
        assert_eq!(auth_reason(err), "card counter not incremented");
        assert_eq!(store.card_counter(card_id).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn bad_cmac_touches_nothing() {
        let (session, store, card_id, keys) = session().await;
        let (p, _) = tap_hex(&keys, 6);

        let err = session.begin_withdraw(&p, "0000000000000000").await.unwrap_err();
        assert_eq!(auth_reason(err), "card not found");

        let card = store.card(card_id).await.unwrap().unwrap();
        assert_eq!(card.last_counter_value, 0);
        assert_eq!(card.lnurlw_k1, "");
        assert_eq!(card.uid, "");
        assert_eq!(store.balance(card_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_params_are_validation_failures() {
        let (session, _, _, _) = session().await;
        let err = session.begin_withdraw("abcd", "ef").await.unwrap_err();
        assert!(matches!(err, LnurlwError::ValidationFailure(ref r) if r == "badly formatted request"));
    }

    #[tokio::test]
    async fn disabled_card_keeps_its_counter() {
        let (session, store, card_id, keys) = session().await;
        let limits = CardLimits {
            enabled: false,
            tx_limit_sats: 0,
            day_limit_sats: 0,
            pin_enable: false,
            pin_number: None,
            pin_limit_sats: 0,
        };
        store.update_card_limits(card_id, &limits).await.unwrap();

        let (p, c) = tap_hex(&keys, 1);
        let err = session.begin_withdraw(&p, &c).await.unwrap_err();
        assert_eq!(auth_reason(err), "card is disabled");
        assert_eq!(store.card_counter(card_id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn exhausted_counter_needs_reissue() {
        let (session, store, card_id, keys) = session().await;
        store
            .advance_counter(card_id, i64::from(Counter::MAX))
            .await
            .unwrap();

        let (p, c) = tap_hex(&keys, Counter::MAX);
        let err = session.begin_withdraw(&p, &c).await.unwrap_err();
        assert_eq!(auth_reason(err), "card counter exhausted");
    }

    #[tokio::test]
    async fn pin_limit_is_advertised_when_pin_enabled() {
        let (session, store, card_id, keys) = session().await;
        let limits = CardLimits {
            enabled: true,
            tx_limit_sats: 0,
            day_limit_sats: 0,
            pin_enable: true,
            pin_number: Some("1234".into()),
            pin_limit_sats: 500,
        };
        store.update_card_limits(card_id, &limits).await.unwrap();

        let (p, c) = tap_hex(&keys, 1);
        let request = session.begin_withdraw(&p, &c).await.unwrap();
        assert_eq!(request.pin_limit, Some(500_000));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["pinLimit"], 500_000);
        assert_eq!(json["defaultDescription"], DEFAULT_DESCRIPTION);
    }

    #[tokio::test]
    async fn expired_or_unknown_k1_is_rejected() {
        let (session, store, card_id, _) = session().await;

        let err = session.live_challenge("nope").await.unwrap_err();
        assert_eq!(auth_reason(err), "k1 not found");

        store
            .set_withdraw_challenge(card_id, "stale", now() - 1)
            .await
            .unwrap();
        let err = session.live_challenge("stale").await.unwrap_err();
        assert_eq!(auth_reason(err), "k1 expired");

        let (k1, _) = session.issue_challenge(card_id).await.unwrap();
        assert_eq!(session.live_challenge(&k1).await.unwrap().card_id, card_id);
    }
}
