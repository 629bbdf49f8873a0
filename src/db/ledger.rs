//! All reads and writes against the card store.
//!
//! Every state change is a single conditional statement so concurrent
//! requests for the same card cannot lose an update or overspend.

use sqlx::{Pool, Sqlite};

use crate::db::models::{
    Card, CardKeyLookup, CardKeys, CardLimits, CardPayment, CardReceipt, WithdrawChallenge,
};

/// Receipts and payments stay listed for a day after creation.
const RECORD_EXPIRY_SECS: i64 = 86_400;

/// Paid receipts minus paid payments and their fees, for one card.
/// Binds the card id twice.
const BALANCE_EXPR: &str = "IFNULL((SELECT SUM(amount_sats) FROM card_receipts \
       WHERE paid_flag = 'Y' AND card_id = ?), 0) \
     - IFNULL((SELECT SUM(amount_sats + fee_sats) FROM card_payments \
       WHERE paid_flag = 'Y' AND card_id = ?), 0)";

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Clone)]
pub struct LedgerStore {
    pool: Pool<Sqlite>,
}

impl LedgerStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert_card(
        &self,
        keys: &CardKeys,
        login: &str,
        password: &str,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO cards (key0_auth, key1_enc, key2_cmac, key3, key4, login, password)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(keys.k0.to_string())
        .bind(keys.k1.to_string())
        .bind(keys.k2.to_string())
        .bind(keys.k3.to_string())
        .bind(keys.k4.to_string())
        .bind(login)
        .bind(password)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn card(&self, card_id: i64) -> Result<Option<Card>, sqlx::Error> {
        sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE card_id = ? AND wiped = 'N'")
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Snapshot of every live card's tap keys, in card id order.
    pub async fn card_key_lookups(&self) -> Result<Vec<CardKeyLookup>, sqlx::Error> {
        sqlx::query_as::<_, CardKeyLookup>(
            "SELECT card_id, key1_enc, key2_cmac, uid FROM cards
             WHERE wiped = 'N' ORDER BY card_id",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Store a newer tap counter. Returns false when the stored value is
    /// already at or past `new_counter`, so concurrent replays of one tap
    /// can only advance it once.
    pub async fn advance_counter(&self, card_id: i64, new_counter: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE cards SET last_counter_value = ?
             WHERE card_id = ? AND wiped = 'N' AND last_counter_value < ?",
        )
        .bind(new_counter)
        .bind(card_id)
        .bind(new_counter)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record the UID the first time a card proves it; never overwrites.
    pub async fn record_card_uid(&self, card_id: i64, uid: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE cards SET uid = ? WHERE card_id = ? AND uid = '' AND wiped = 'N'")
            .bind(uid)
            .bind(card_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_card_keys(&self, card_id: i64, keys: &CardKeys) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE cards SET key0_auth = ?, key1_enc = ?, key2_cmac = ?, key3 = ?, key4 = ?
             WHERE card_id = ? AND wiped = 'N'",
        )
        .bind(keys.k0.to_string())
        .bind(keys.k1.to_string())
        .bind(keys.k2.to_string())
        .bind(keys.k3.to_string())
        .bind(keys.k4.to_string())
        .bind(card_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn update_card_limits(
        &self,
        card_id: i64,
        limits: &CardLimits,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE cards SET lnurlw_enable = ?, tx_limit_sats = ?, day_limit_sats = ?,
             pin_enable = ?, pin_number = COALESCE(?, pin_number), pin_limit_sats = ?
             WHERE card_id = ? AND wiped = 'N'",
        )
        .bind(limits.enabled_flag())
        .bind(limits.tx_limit_sats)
        .bind(limits.day_limit_sats)
        .bind(limits.pin_flag())
        .bind(limits.pin_number.as_deref())
        .bind(limits.pin_limit_sats)
        .bind(card_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Retire a card for good and hand back its keys so it can be reset.
    /// `None` when the card does not exist or was already wiped.
    pub async fn wipe_card(&self, card_id: i64) -> Result<Option<CardKeys>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE cards SET wiped = 'Y', access_token = '', refresh_token = '', lnurlw_k1 = ''
             WHERE card_id = ? AND wiped = 'N'",
        )
        .bind(card_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(None);
        }

        let row: (String, String, String, String, String) = sqlx::query_as(
            "SELECT key0_auth, key1_enc, key2_cmac, key3, key4 FROM cards WHERE card_id = ?",
        )
        .bind(card_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let decode = |hex: &str| {
            crate::crypto::AesKey::from_hex(hex).map_err(|e| sqlx::Error::Decode(Box::new(e)))
        };
        Ok(Some(CardKeys {
            k0: decode(&row.0)?,
            k1: decode(&row.1)?,
            k2: decode(&row.2)?,
            k3: decode(&row.3)?,
            k4: decode(&row.4)?,
        }))
    }

    pub async fn set_withdraw_challenge(
        &self,
        card_id: i64,
        k1: &str,
        expiry: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE cards SET lnurlw_k1 = ?, lnurlw_k1_expiry = ?
             WHERE card_id = ? AND wiped = 'N'",
        )
        .bind(k1)
        .bind(expiry)
        .bind(card_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn withdraw_challenge(
        &self,
        k1: &str,
    ) -> Result<Option<WithdrawChallenge>, sqlx::Error> {
        if k1.is_empty() {
            return Ok(None);
        }

        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT card_id, lnurlw_k1_expiry FROM cards WHERE lnurlw_k1 = ? AND wiped = 'N'",
        )
        .bind(k1)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(card_id, expiry)| WithdrawChallenge { card_id, expiry }))
    }

    /// Spend a challenge. Only one caller presenting `k1` gets `true`.
    pub async fn consume_withdraw_challenge(
        &self,
        card_id: i64,
        k1: &str,
    ) -> Result<bool, sqlx::Error> {
        if k1.is_empty() {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE cards SET lnurlw_k1 = '', lnurlw_k1_expiry = 0
             WHERE card_id = ? AND lnurlw_k1 = ? AND wiped = 'N'",
        )
        .bind(card_id)
        .bind(k1)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Swap the token pair of the card currently holding `old_refresh`.
    pub async fn rotate_tokens(
        &self,
        old_refresh: &str,
        new_refresh: &str,
        new_access: &str,
    ) -> Result<bool, sqlx::Error> {
        if old_refresh.is_empty() {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE cards SET access_token = ?, refresh_token = ?
             WHERE refresh_token = ? AND wiped = 'N'",
        )
        .bind(new_access)
        .bind(new_refresh)
        .bind(old_refresh)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Issue a token pair to the card whose login and password match.
    pub async fn set_tokens_from_credentials(
        &self,
        login: &str,
        password: &str,
        access: &str,
        refresh: &str,
    ) -> Result<bool, sqlx::Error> {
        if login.is_empty() || password.is_empty() {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE cards SET access_token = ?, refresh_token = ?
             WHERE login = ? AND password = ? AND wiped = 'N'",
        )
        .bind(access)
        .bind(refresh)
        .bind(login)
        .bind(password)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn card_id_for_access_token(&self, token: &str) -> Result<Option<i64>, sqlx::Error> {
        if token.is_empty() {
            return Ok(None);
        }

        sqlx::query_scalar("SELECT card_id FROM cards WHERE access_token = ? AND wiped = 'N'")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn balance(&self, card_id: i64) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT {BALANCE_EXPR}");
        sqlx::query_scalar(&sql)
            .bind(card_id)
            .bind(card_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Lock `amount_sats` against the card before paying `invoice`.
    ///
    /// The row is only inserted if the balance at insert time still covers
    /// `required_sats`; `None` means it did not and nothing was written.
    pub async fn reserve_payment(
        &self,
        card_id: i64,
        amount_sats: i64,
        invoice: &str,
        required_sats: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        let created = now();
        let sql = format!(
            "INSERT INTO card_payments
                 (card_id, amount_sats, ln_invoice, paid_flag, timestamp, expire_time)
             SELECT ?, ?, ?, 'Y', ?, ?
             WHERE ({BALANCE_EXPR}) >= ?"
        );

        let result = sqlx::query(&sql)
            .bind(card_id)
            .bind(amount_sats)
            .bind(invoice)
            .bind(created)
            .bind(created + RECORD_EXPIRY_SECS)
            .bind(card_id)
            .bind(card_id)
            .bind(required_sats)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            Ok(Some(result.last_insert_rowid()))
        } else {
            Ok(None)
        }
    }

    pub async fn mark_payment_unpaid(&self, card_payment_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE card_payments SET paid_flag = 'N' WHERE card_payment_id = ?")
            .bind(card_payment_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_payment_fee(&self, card_payment_id: i64, fee_sats: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE card_payments SET fee_sats = ? WHERE card_payment_id = ?")
            .bind(fee_sats)
            .bind(card_payment_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn payments(&self, card_id: i64) -> Result<Vec<CardPayment>, sqlx::Error> {
        sqlx::query_as::<_, CardPayment>(
            "SELECT * FROM card_payments WHERE card_id = ? ORDER BY card_payment_id DESC",
        )
        .bind(card_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Sum of paid (including locked) payment amounts since `since`.
    pub async fn paid_payments_since(&self, card_id: i64, since: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT IFNULL(SUM(amount_sats), 0) FROM card_payments
             WHERE card_id = ? AND paid_flag = 'Y' AND timestamp >= ?",
        )
        .bind(card_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn add_receipt(
        &self,
        card_id: i64,
        invoice: &str,
        payment_hash: &str,
        amount_sats: i64,
    ) -> Result<i64, sqlx::Error> {
        let created = now();
        let result = sqlx::query(
            "INSERT INTO card_receipts
                 (card_id, ln_invoice, r_hash_hex, amount_sats, timestamp, expire_time)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(card_id)
        .bind(invoice)
        .bind(payment_hash)
        .bind(amount_sats)
        .bind(created)
        .bind(created + RECORD_EXPIRY_SECS)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Returns whether a receipt with this hash exists. Safe to repeat.
    pub async fn mark_receipt_paid(&self, payment_hash: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE card_receipts SET paid_flag = 'Y' WHERE r_hash_hex = ?")
            .bind(payment_hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Newest first.
    pub async fn receipts(
        &self,
        card_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<CardReceipt>, sqlx::Error> {
        sqlx::query_as::<_, CardReceipt>(
            "SELECT card_receipt_id, card_id, ln_invoice, r_hash_hex, amount_sats, paid_flag,
                    timestamp, expire_time
             FROM card_receipts WHERE card_id = ?
             ORDER BY card_receipt_id DESC LIMIT ?",
        )
        .bind(card_id)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{fund, store_with_card};
    use super::*;

    #[tokio::test]
    async fn balance_counts_only_paid_rows() {
        let (store, card_id, _) = store_with_card().await;
        assert_eq!(store.balance(card_id).await.unwrap(), 0);

        store.add_receipt(card_id, "lnbc1", "aa", 500).await.unwrap();
        assert_eq!(store.balance(card_id).await.unwrap(), 0);

        assert!(store.mark_receipt_paid("aa").await.unwrap());
        assert_eq!(store.balance(card_id).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn receipt_then_payment_with_fee() {
        let (store, card_id, _) = store_with_card().await;
        fund(&store, card_id, 1000).await;

        let payment_id = store
            .reserve_payment(card_id, 200, "lnbc200", 0)
            .await
            .unwrap()
            .unwrap();
        store.set_payment_fee(payment_id, 10).await.unwrap();

        assert_eq!(store.balance(card_id).await.unwrap(), 790);
    }

    #[tokio::test]
    async fn unpaid_payment_releases_funds() {
        let (store, card_id, _) = store_with_card().await;
        fund(&store, card_id, 1000).await;

        let payment_id = store
            .reserve_payment(card_id, 300, "lnbc300", 300)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.balance(card_id).await.unwrap(), 700);

        store.mark_payment_unpaid(payment_id).await.unwrap();
        assert_eq!(store.balance(card_id).await.unwrap(), 1000);

        let payment = store.payment(payment_id).await.unwrap().unwrap();
        assert!(!payment.is_paid());
    }

    #[tokio::test]
    async fn reservation_refused_when_balance_short() {
        let (store, card_id, _) = store_with_card().await;
        fund(&store, card_id, 100).await;

        let reserved = store.reserve_payment(card_id, 90, "lnbc90", 101).await.unwrap();
        assert!(reserved.is_none());
        assert!(store.payments(card_id).await.unwrap().is_empty());
        assert_eq!(store.balance(card_id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn second_reservation_sees_the_first() {
        let (store, card_id, _) = store_with_card().await;
        fund(&store, card_id, 100).await;

        assert!(store.reserve_payment(card_id, 60, "a", 60).await.unwrap().is_some());
        assert!(store.reserve_payment(card_id, 60, "b", 60).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn balances_are_per_card() {
        let (store, card_a, _) = store_with_card().await;
        let card_b = store.insert_card(&CardKeys::generate(), "b", "b").await.unwrap();
        fund(&store, card_a, 1000).await;

        assert_eq!(store.balance(card_b).await.unwrap(), 0);
        assert!(store.reserve_payment(card_b, 1, "x", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_receipt_paid_is_idempotent() {
        let (store, card_id, _) = store_with_card().await;
        store.add_receipt(card_id, "lnbc1", "bb", 50).await.unwrap();

        assert!(store.mark_receipt_paid("bb").await.unwrap());
        assert!(store.mark_receipt_paid("bb").await.unwrap());
        assert_eq!(store.balance(card_id).await.unwrap(), 50);
        assert!(!store.mark_receipt_paid("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn receipt_hash_is_unique() {
        let (store, card_id, _) = store_with_card().await;
        store.add_receipt(card_id, "lnbc1", "cc", 50).await.unwrap();
        assert!(store.add_receipt(card_id, "lnbc2", "cc", 70).await.is_err());
    }

    #[tokio::test]
    async fn counter_only_moves_forward() {
        let (store, card_id, _) = store_with_card().await;

        assert!(store.advance_counter(card_id, 5).await.unwrap());
        assert!(!store.advance_counter(card_id, 5).await.unwrap());
        assert!(!store.advance_counter(card_id, 4).await.unwrap());
        assert_eq!(store.card_counter(card_id).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn token_rotation_invalidates_old_refresh() {
        let (store, card_id, _) = store_with_card().await;
        assert!(
            store
                .set_tokens_from_credentials("login", "password", "access1", "refresh1")
                .await
                .unwrap()
        );
        assert_eq!(
            store.card_id_for_access_token("access1").await.unwrap(),
            Some(card_id)
        );

        assert!(store.rotate_tokens("refresh1", "refresh2", "access2").await.unwrap());
        assert_eq!(store.card_id_for_access_token("access1").await.unwrap(), None);
        assert_eq!(
            store.card_id_for_access_token("access2").await.unwrap(),
            Some(card_id)
        );

        // stale refresh token cannot rotate again
        assert!(!store.rotate_tokens("refresh1", "refresh3", "access3").await.unwrap());
        assert_eq!(
            store.card_id_for_access_token("access2").await.unwrap(),
            Some(card_id)
        );
    }

    #[tokio::test]
    async fn credentials_must_match() {
        let (store, _, _) = store_with_card().await;
        assert!(
            !store
                .set_tokens_from_credentials("login", "wrong", "a", "r")
                .await
                .unwrap()
        );
        assert_eq!(store.card_id_for_access_token("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_tokens_never_authenticate() {
        let (store, _, _) = store_with_card().await;
        // fresh cards hold empty tokens
        assert_eq!(store.card_id_for_access_token("").await.unwrap(), None);
        assert!(!store.rotate_tokens("", "r", "a").await.unwrap());
    }

    #[tokio::test]
    async fn wiped_card_disappears_everywhere() {
        let (store, card_id, keys) = store_with_card().await;
        store
            .set_tokens_from_credentials("login", "password", "acc", "ref")
            .await
            .unwrap();
        store.set_withdraw_challenge(card_id, "k1value", i64::MAX).await.unwrap();

        let returned = store.wipe_card(card_id).await.unwrap().unwrap();
        assert_eq!(returned, keys);

        assert!(store.card(card_id).await.unwrap().is_none());
        assert!(store.card_key_lookups().await.unwrap().is_empty());
        assert_eq!(store.card_counter(card_id).await.unwrap(), None);
        assert!(store.withdraw_challenge("k1value").await.unwrap().is_none());
        assert_eq!(store.card_id_for_access_token("acc").await.unwrap(), None);
        assert!(!store.rotate_tokens("ref", "r2", "a2").await.unwrap());
        assert!(!store.advance_counter(card_id, 10).await.unwrap());
        assert!(!store.set_card_keys(card_id, &CardKeys::generate()).await.unwrap());

        // wiping is terminal
        assert!(store.wipe_card(card_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn limits_update_keeps_pin_when_absent() {
        let (store, card_id, _) = store_with_card().await;
        let mut limits = CardLimits {
            enabled: true,
            tx_limit_sats: 1000,
            day_limit_sats: 5000,
            pin_enable: true,
            pin_number: Some("4321".to_string()),
            pin_limit_sats: 200,
        };
        assert!(store.update_card_limits(card_id, &limits).await.unwrap());

        limits.pin_number = None;
        limits.tx_limit_sats = 2000;
        assert!(store.update_card_limits(card_id, &limits).await.unwrap());

        let card = store.card(card_id).await.unwrap().unwrap();
        assert_eq!(card.pin_number, "4321");
        assert_eq!(card.tx_limit_sats, 2000);
        assert!(card.pin_required());
    }

    #[tokio::test]
    async fn receipts_listed_newest_first_with_limit() {
        let (store, card_id, _) = store_with_card().await;
        for (hash, amount) in [("h1", 10), ("h2", 20), ("h3", 30)] {
            store.add_receipt(card_id, "lnbc", hash, amount).await.unwrap();
        }

        let all = store.receipts(card_id, None).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.r_hash_hex.as_str()).collect::<Vec<_>>(),
            ["h3", "h2", "h1"]
        );
        assert_eq!(store.receipts(card_id, Some(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn daily_total_ignores_unlocked_payments() {
        let (store, card_id, _) = store_with_card().await;
        fund(&store, card_id, 1000).await;

        let kept = store.reserve_payment(card_id, 100, "a", 0).await.unwrap().unwrap();
        let released = store.reserve_payment(card_id, 200, "b", 0).await.unwrap().unwrap();
        store.mark_payment_unpaid(released).await.unwrap();

        let since = now() - RECORD_EXPIRY_SECS;
        assert_eq!(store.paid_payments_since(card_id, since).await.unwrap(), 100);
        assert!(store.payment(kept).await.unwrap().unwrap().is_paid());
    }

    #[tokio::test]
    async fn challenge_is_spent_once() {
        let (store, card_id, _) = store_with_card().await;
        assert!(store.set_withdraw_challenge(card_id, "k1abc", 42).await.unwrap());
        assert_eq!(
            store.withdraw_challenge("k1abc").await.unwrap(),
            Some(WithdrawChallenge { card_id, expiry: 42 })
        );

        assert!(!store.consume_withdraw_challenge(card_id, "other").await.unwrap());
        assert!(store.consume_withdraw_challenge(card_id, "k1abc").await.unwrap());
        assert!(!store.consume_withdraw_challenge(card_id, "k1abc").await.unwrap());
        assert_eq!(store.withdraw_challenge("k1abc").await.unwrap(), None);
    }
}
