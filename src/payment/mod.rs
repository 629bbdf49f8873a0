//! Second leg of LNURL-withdraw: pay the wallet's invoice from the card.
//!
//! The callback walks `ValidatingChallenge -> ValidatingInvoice ->
//! CheckingBalance -> Reserved -> AwaitingBackend -> Reconciled`. Every
//! rejection before `Reserved` leaves the ledger untouched. Once funds are
//! reserved the request always ends in one of the reconciled outcomes.

use std::{fmt, sync::Arc};

use crate::{
    config::Config,
    crypto::secrets_match,
    db::{LedgerStore, models::Card},
    error::LnurlwError,
    lightning::{
        BackendError, FundsDisposition, Invoice, PayInvoiceResponse, PaymentBackend, PaymentReason,
    },
    withdraw::WithdrawSession,
};

const DAY_SECS: i64 = 86_400;

/// Routing fee headroom a payment must leave in the balance:
/// a 4 sat base plus 0.4% of the amount.
pub fn max_fee(amount_sats: i64) -> i64 {
    4 + amount_sats * 4 / 1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ValidatingChallenge,
    ValidatingInvoice,
    CheckingBalance,
    Reserved,
    AwaitingBackend,
    Reconciled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ValidatingChallenge => "validating_challenge",
            Self::ValidatingInvoice => "validating_invoice",
            Self::CheckingBalance => "checking_balance",
            Self::Reserved => "reserved",
            Self::AwaitingBackend => "awaiting_backend",
            Self::Reconciled => "reconciled",
        };
        f.write_str(name)
    }
}

/// A payment that went out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub card_payment_id: i64,
    pub amount_sats: i64,
    pub fee_sats: i64,
}

pub struct PaymentOrchestrator {
    store: LedgerStore,
    config: Arc<Config>,
    backend: Arc<dyn PaymentBackend>,
    session: WithdrawSession,
}

impl PaymentOrchestrator {
    pub fn new(store: LedgerStore, config: Arc<Config>, backend: Arc<dyn PaymentBackend>) -> Self {
        let session = WithdrawSession::new(store.clone(), config.clone());
        Self {
            store,
            config,
            backend,
            session,
        }
    }

    /// Handle `GET /cb?k1=..&pr=..[&pin=..]`.
    pub async fn process_callback(
        &self,
        k1: &str,
        pr: &str,
        pin: Option<&str>,
    ) -> Result<Settled, LnurlwError> {
        tracing::debug!(stage = %Stage::ValidatingChallenge, "withdraw callback");
        let challenge = self.session.live_challenge(k1).await?;
        let card_id = challenge.card_id;

        tracing::debug!(card_id, stage = %Stage::ValidatingInvoice, "withdraw callback");
        let invoice = pr.parse::<Invoice>().map_err(|e| {
            tracing::debug!(card_id, error = %e, "unusable invoice");
            LnurlwError::validation("failed to decode payment request")
        })?;
        if invoice.is_expired() {
            return Err(LnurlwError::validation("payment request has expired"));
        }
        tracing::debug!(card_id, payment_hash = %invoice.payment_hash(), "invoice decoded");
        let amount_sats = invoice
            .amount_sats()
            .map_err(|e| LnurlwError::validation(e.to_string()))?;
        let amount_sats = i64::try_from(amount_sats)
            .map_err(|_| LnurlwError::validation("amount out of range"))?;

        let fee_headroom = self.authorize(card_id, amount_sats, pin).await?;

        // one tap, one payment; spent only once the withdraw is affordable
        if !self.store.consume_withdraw_challenge(card_id, k1).await? {
            return Err(LnurlwError::auth("k1 not found"));
        }

        self.pay_reserved(card_id, amount_sats, pr.trim(), fee_headroom)
            .await
    }

    /// Amount, card policy and balance checks. Writes nothing; returns the
    /// fee headroom the reservation has to cover.
    async fn authorize(
        &self,
        card_id: i64,
        amount_sats: i64,
        pin: Option<&str>,
    ) -> Result<i64, LnurlwError> {
        self.check_amount(amount_sats)?;

        let card = self
            .store
            .card(card_id)
            .await?
            .ok_or_else(|| LnurlwError::auth("card not found"))?;
        self.check_card_policy(&card, amount_sats, pin).await?;

        tracing::debug!(card_id, amount_sats, stage = %Stage::CheckingBalance, "withdraw callback");
        let fee_headroom = max_fee(amount_sats);
        let balance = self.store.balance(card_id).await?;
        if amount_sats > balance {
            return Err(LnurlwError::insufficient("Insufficient funds"));
        }
        if amount_sats + fee_headroom > balance {
            return Err(LnurlwError::insufficient("Insufficient funds with network fees"));
        }

        Ok(fee_headroom)
    }

    /// Lock the funds, pay, and reconcile the reservation with the outcome.
    async fn pay_reserved(
        &self,
        card_id: i64,
        amount_sats: i64,
        invoice: &str,
        fee_headroom: i64,
    ) -> Result<Settled, LnurlwError> {
        // the balance may have moved since `authorize`; the insert re-checks it
        let card_payment_id = self
            .store
            .reserve_payment(card_id, amount_sats, invoice, amount_sats + fee_headroom)
            .await?
            .ok_or_else(|| LnurlwError::insufficient("Insufficient funds"))?;
        tracing::info!(card_id, card_payment_id, amount_sats, stage = %Stage::Reserved, "funds reserved");

        tracing::debug!(card_payment_id, stage = %Stage::AwaitingBackend, "paying invoice");
        let result = self.backend.pay_invoice(amount_sats as u64, invoice).await;

        let outcome = self.reconcile(card_id, card_payment_id, amount_sats, result).await;
        tracing::debug!(card_payment_id, stage = %Stage::Reconciled, ok = outcome.is_ok(), "withdraw callback");
        outcome
    }

    fn check_amount(&self, amount_sats: i64) -> Result<(), LnurlwError> {
        let max = self.config.max_withdraw_sats as i64;
        let min = self.config.min_withdraw_sats as i64;

        if amount_sats == max {
            return Err(LnurlwError::validation(
                "this is a bolt card - use a Point of Sale",
            ));
        }
        if amount_sats < min.max(1) || amount_sats > max {
            return Err(LnurlwError::validation("amount outside withdrawable range"));
        }
        Ok(())
    }

    async fn check_card_policy(
        &self,
        card: &Card,
        amount_sats: i64,
        pin: Option<&str>,
    ) -> Result<(), LnurlwError> {
        if !card.is_enabled() {
            return Err(LnurlwError::auth("card is disabled"));
        }

        if card.tx_limit_sats > 0 && amount_sats > card.tx_limit_sats {
            return Err(LnurlwError::validation("amount exceeds card transaction limit"));
        }

        if card.day_limit_sats > 0 {
            let since = chrono::Utc::now().timestamp() - DAY_SECS;
            let spent = self.store.paid_payments_since(card.card_id, since).await?;
            if spent + amount_sats > card.day_limit_sats {
                return Err(LnurlwError::validation("amount exceeds card daily limit"));
            }
        }

        if card.pin_required() && amount_sats >= card.pin_limit_sats {
            match pin {
                None | Some("") => return Err(LnurlwError::auth("PIN required")),
                Some(pin) if !secrets_match(pin, &card.pin_number) => {
                    tracing::info!(card_id = card.card_id, "wrong PIN on withdraw");
                    return Err(LnurlwError::auth("incorrect PIN"));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    async fn reconcile(
        &self,
        card_id: i64,
        card_payment_id: i64,
        amount_sats: i64,
        result: Result<PayInvoiceResponse, BackendError>,
    ) -> Result<Settled, LnurlwError> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                return match e.disposition() {
                    FundsDisposition::Unlock => {
                        tracing::warn!(card_id, card_payment_id, error = %e, "payment not sent, unlocking funds");
                        self.store.mark_payment_unpaid(card_payment_id).await?;
                        Err(LnurlwError::ExternalDefinite {
                            card_payment_id,
                            reason: e.reason().to_string(),
                        })
                    }
                    FundsDisposition::KeepLocked => {
                        tracing::error!(
                            card_id,
                            card_payment_id,
                            amount_sats,
                            error = %e,
                            "payment outcome unknown, funds stay locked for manual reconciliation"
                        );
                        Err(LnurlwError::ExternalAmbiguous {
                            card_payment_id,
                            reason: e.reason().to_string(),
                        })
                    }
                };
            }
        };

        let unlock_reason = match PaymentReason::from_backend(response.reason.as_deref()) {
            PaymentReason::None => {
                let fee_sats = response.routing_fee_sat.max(0);
                self.store.set_payment_fee(card_payment_id, fee_sats).await?;
                tracing::info!(card_id, card_payment_id, amount_sats, fee_sats, "payment sent");
                return Ok(Settled {
                    card_payment_id,
                    amount_sats,
                    fee_sats,
                });
            }
            PaymentReason::AlreadyPaid => "duplicate invoice",
            PaymentReason::RecipientRejected => "receiver rejected",
            PaymentReason::InsufficientBackendFunds => "funds low",
            PaymentReason::NoRoute => "route not found",
            PaymentReason::Unrecognized(reason) => {
                tracing::error!(
                    card_id,
                    card_payment_id,
                    amount_sats,
                    backend_reason = %reason,
                    "unrecognized payment result, funds stay locked for manual reconciliation"
                );
                return Err(LnurlwError::ExternalAmbiguous {
                    card_payment_id,
                    reason: "bad payment backend result".to_string(),
                });
            }
        };

        tracing::warn!(card_id, card_payment_id, reason = unlock_reason, "payment refused, unlocking funds");
        self.store.mark_payment_unpaid(card_payment_id).await?;
        Err(LnurlwError::ExternalDefinite {
            card_payment_id,
            reason: unlock_reason.to_string(),
        })
    }
}
