use crate::crypto::{CardUid, Counter, CryptoError, build_sv2, decrypt_block, parse_picc_data, verify_cmac};

/// UID and counter recovered from a tap that authenticated against one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTap {
    pub uid: CardUid,
    pub counter: Counter,
}

/// Try one card's keys against a tap without touching any store.
///
/// `Ok(None)` means the tap is not from this card: either the block did
/// not decrypt to PICC data under `k1` or the CMAC under `k2` differs.
/// Errors are reserved for unusable keys.
pub fn check_card_tap(
    k1_hex: &str,
    k2_hex: &str,
    p: &[u8; 16],
    c: &[u8; 8],
) -> Result<Option<VerifiedTap>, CryptoError> {
    let k1 = hex::decode(k1_hex)?;
    let k2 = hex::decode(k2_hex)?;

    let decrypted = decrypt_block(&k1, p)?;
    let (uid, counter) = match parse_picc_data(&decrypted) {
        Ok(parsed) => parsed,
        Err(CryptoError::MissingPiccTag) => return Ok(None),
        Err(e) => return Err(e),
    };

    let sv2 = build_sv2(&uid, &counter);
    if verify_cmac(&k2, &sv2, c)? {
        Ok(Some(VerifiedTap { uid, counter }))
    } else {
        Ok(None)
    }
}
