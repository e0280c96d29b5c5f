//! Privileged minting of new API keys.

use crate::error::GatewayError;
use crate::keys::{ApiKey, BudgetPolicy, KeyStore, ResetPeriod};

const TOKEN_BYTES: usize = 32;
const MAX_MINT_ATTEMPTS: usize = 4;

/// Mints a fresh opaque token, attaches the budget policy and registers the
/// key. A token collision should be impossible at this entropy; if one shows
/// up anyway it is logged and retried with a new token, and only repeated
/// collisions surface as `DuplicateKey`.
pub fn issue(
    store: &KeyStore,
    total_usd_micros: u64,
    period: ResetPeriod,
) -> Result<ApiKey, GatewayError> {
    let policy = BudgetPolicy {
        total_usd_micros,
        period,
    };

    for attempt in 1..=MAX_MINT_ATTEMPTS {
        let key = ApiKey::new(generate_token()?, policy);
        match store.register(key.clone()) {
            Ok(()) => return Ok(key),
            Err(GatewayError::DuplicateKey) => {
                eprintln!(
                    "spendgate: freshly generated api key collided with an existing key \
                     (attempt {attempt}/{MAX_MINT_ATTEMPTS}); regenerating"
                );
            }
            Err(err) => return Err(err),
        }
    }
    Err(GatewayError::DuplicateKey)
}

fn generate_token() -> Result<String, GatewayError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::fill(&mut bytes).map_err(|err| GatewayError::Store {
        message: format!("entropy source failed: {err}"),
    })?;
    Ok(format!("sk-{}", hex_encode(&bytes)))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_key_is_registered_and_opaque() {
        let store = KeyStore::new();
        let key = issue(&store, 100_000_000, ResetPeriod::Monthly).expect("issue");

        assert!(store.is_valid(&key.token));
        assert_eq!(
            store.policy_for(&key.token).map(|p| p.total_usd_micros),
            Some(100_000_000)
        );
        assert!(key.token.starts_with("sk-"));
        // 32 random bytes hex-encoded behind the prefix.
        assert_eq!(key.token.len(), 3 + TOKEN_BYTES * 2);
    }

    #[test]
    fn issued_tokens_are_unique() {
        let store = KeyStore::new();
        let a = issue(&store, 1, ResetPeriod::None).expect("issue");
        let b = issue(&store, 1, ResetPeriod::None).expect("issue");
        assert_ne!(a.token, b.token);
        assert_eq!(store.len(), 2);
    }
}
