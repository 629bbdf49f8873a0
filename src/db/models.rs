use serde::Serialize;

use crate::crypto::AesKey;

pub const FLAG_YES: &str = "Y";
pub const FLAG_NO: &str = "N";

fn flag(value: bool) -> &'static str {
    if value { FLAG_YES } else { FLAG_NO }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Card {
    pub card_id: i64,
    pub key0_auth: String,
    pub key1_enc: String,
    pub key2_cmac: String,
    pub key3: String,
    pub key4: String,
    pub login: String,
    pub password: String,
    pub access_token: String,
    pub refresh_token: String,
    pub uid: String,
    pub last_counter_value: i64,
    pub lnurlw_enable: String,
    pub lnurlw_k1: String,
    pub lnurlw_k1_expiry: i64,
    pub tx_limit_sats: i64,
    pub day_limit_sats: i64,
    pub pin_enable: String,
    pub pin_number: String,
    pub pin_limit_sats: i64,
    pub wiped: String,
}

impl Card {
    pub fn is_enabled(&self) -> bool {
        self.lnurlw_enable == FLAG_YES
    }

    pub fn pin_required(&self) -> bool {
        self.pin_enable == FLAG_YES
    }
}

/// The columns a tap needs to be tried against one card.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CardKeyLookup {
    pub card_id: i64,
    pub key1_enc: String,
    pub key2_cmac: String,
    pub uid: String,
}

/// The five application keys written to a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardKeys {
    pub k0: AesKey,
    pub k1: AesKey,
    pub k2: AesKey,
    pub k3: AesKey,
    pub k4: AesKey,
}

impl CardKeys {
    pub fn generate() -> Self {
        Self {
            k0: AesKey::generate(),
            k1: AesKey::generate(),
            k2: AesKey::generate(),
            k3: AesKey::generate(),
            k4: AesKey::generate(),
        }
    }
}

/// Spending policy as set from the wallet app.
#[derive(Debug, Clone)]
pub struct CardLimits {
    pub enabled: bool,
    pub tx_limit_sats: i64,
    pub day_limit_sats: i64,
    pub pin_enable: bool,
    /// `None` keeps the stored PIN.
    pub pin_number: Option<String>,
    pub pin_limit_sats: i64,
}

impl CardLimits {
    pub fn enabled_flag(&self) -> &'static str {
        flag(self.enabled)
    }

    pub fn pin_flag(&self) -> &'static str {
        flag(self.pin_enable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawChallenge {
    pub card_id: i64,
    pub expiry: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CardReceipt {
    pub card_receipt_id: i64,
    pub card_id: i64,
    pub ln_invoice: String,
    pub r_hash_hex: String,
    pub amount_sats: i64,
    pub paid_flag: String,
    pub timestamp: i64,
    pub expire_time: i64,
}

impl CardReceipt {
    pub fn is_paid(&self) -> bool {
        self.paid_flag == FLAG_YES
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CardPayment {
    pub card_payment_id: i64,
    pub card_id: i64,
    pub ln_invoice: String,
    pub amount_sats: i64,
    pub fee_sats: i64,
    pub paid_flag: String,
    pub timestamp: i64,
    pub expire_time: i64,
}

impl CardPayment {
    pub fn is_paid(&self) -> bool {
        self.paid_flag == FLAG_YES
    }
}
