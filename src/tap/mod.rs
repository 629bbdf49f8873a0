//! Tap authentication.
//!
//! A tap does not name its card: the only way to tell which card sent
//! `p` is to try every card's keys until one decrypts it and the CMAC
//! over the recovered UID and counter checks out.

pub mod pure;
mod store;

use crate::{
    crypto::{CardUid, Counter},
    db::models::CardKeyLookup,
};

pub use pure::check_card_tap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TapError {
    #[error("badly formatted request")]
    MalformedRequest,
}

/// Decoded `p` and `c` query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapParams {
    pub p: [u8; 16],
    pub c: [u8; 8],
}

impl TapParams {
    pub fn from_hex(p_hex: &str, c_hex: &str) -> Result<Self, TapError> {
        let p = hex::decode(p_hex.trim()).map_err(|_| TapError::MalformedRequest)?;
        let c = hex::decode(c_hex.trim()).map_err(|_| TapError::MalformedRequest)?;

        Ok(Self {
            p: p.try_into().map_err(|_| TapError::MalformedRequest)?,
            c: c.try_into().map_err(|_| TapError::MalformedRequest)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapMatch {
    pub card_id: i64,
    pub uid: CardUid,
    pub counter: Counter,
}

/// Where the verifier gets the keys of every live card.
#[async_trait::async_trait]
pub trait CardKeySource: Send + Sync {
    async fn card_key_lookups(&self) -> Result<Vec<CardKeyLookup>, sqlx::Error>;
}

pub struct TapVerifier<'a, S: CardKeySource> {
    source: &'a S,
}

impl<'a, S: CardKeySource> TapVerifier<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// First live card, in card id order, whose keys authenticate the tap.
    ///
    /// Reads a single snapshot of the card keys and writes nothing.
    pub async fn find_card(&self, tap: &TapParams) -> Result<Option<TapMatch>, sqlx::Error> {
        let candidates = self.source.card_key_lookups().await?;
        tracing::debug!(candidates = candidates.len(), "scanning cards for tap");

        for card in &candidates {
            let verified = match check_card_tap(&card.key1_enc, &card.key2_cmac, &tap.p, &tap.c) {
                Ok(Some(verified)) => verified,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(card_id = card.card_id, error = %e, "skipping card with unusable keys");
                    continue;
                }
            };

            let uid = verified.uid.to_string();
            if !card.uid.is_empty() && card.uid != uid {
                tracing::warn!(
                    card_id = card.card_id,
                    stored_uid = %card.uid,
                    tap_uid = %uid,
                    "tap authenticated with a different uid than recorded"
                );
                continue;
            }

            return Ok(Some(TapMatch {
                card_id: card.card_id,
                uid: verified.uid,
                counter: verified.counter,
            }));
        }

        Ok(None)
    }
}
