//! NIP-26 delegation tokens.
//!
//! A delegator signs `SHA-256("nostr:delegation:<delegatee>:<conditions>")`
//! where conditions look like `kind=1&created_at>100&created_at<200`.

use crate::crypto::{CryptoError, SigningKeys};
use crate::keys;
use crate::types::Pubkey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Conditions a delegation token is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    /// The single event kind the delegatee may publish.
    pub kind: u16,
    /// Lower time bound (exclusive), Unix seconds.
    pub since: u64,
    /// Upper time bound (exclusive), Unix seconds.
    pub until: u64,
}

impl Conditions {
    /// Renders the condition query string that gets signed.
    ///
    /// # Examples
    ///
    /// ```
    /// use nkc_common::nip26::Conditions;
    ///
    /// let c = Conditions { kind: 1, since: 100, until: 200 };
    /// assert_eq!(c.query(), "kind=1&created_at>100&created_at<200");
    /// ```
    #[must_use]
    pub fn query(&self) -> String {
        format!(
            "kind={}&created_at>{}&created_at<{}",
            self.kind, self.since, self.until
        )
    }
}

/// A signed delegation, in the shape returned to remote applications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    /// Delegator public key (hex).
    pub from: String,
    /// Delegatee public key (hex).
    pub to: String,
    /// Condition query string.
    pub cond: String,
    /// Hex Schnorr signature over the delegation digest.
    pub sig: String,
}

/// Computes the digest a delegator signs.
#[must_use]
pub fn delegation_digest(delegatee: &Pubkey, conditions: &str) -> [u8; 32] {
    let token = format!("nostr:delegation:{}:{conditions}", keys::encode(delegatee));
    Sha256::digest(token.as_bytes()).into()
}

/// Creates a delegation from `signer` to `delegatee` under `conditions`.
///
/// # Errors
///
/// Returns [`CryptoError::Signing`] if the signer fails.
pub fn create(
    signer: &SigningKeys,
    delegatee: &Pubkey,
    conditions: &Conditions,
) -> Result<Delegation, CryptoError> {
    let cond = conditions.query();
    let sig = signer.sign(&delegation_digest(delegatee, &cond))?;
    Ok(Delegation {
        from: keys::encode(&signer.public_key()),
        to: keys::encode(delegatee),
        cond,
        sig: keys::encode(&sig),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[test]
    fn delegation_signature_verifies() {
        let delegator = SigningKeys::generate();
        let delegatee = [3u8; 32];
        let cond = Conditions {
            kind: 1,
            since: 1_700_000_000,
            until: 1_800_000_000,
        };
        let d = create(&delegator, &delegatee, &cond).unwrap();
        assert_eq!(d.from, keys::encode(&delegator.public_key()));
        assert_eq!(d.to, keys::encode(&delegatee));
        assert_eq!(d.cond, "kind=1&created_at>1700000000&created_at<1800000000");

        let sig: [u8; 64] = hex::decode(&d.sig).unwrap().try_into().unwrap();
        let digest = delegation_digest(&delegatee, &d.cond);
        assert!(crypto::verify(&delegator.public_key(), &digest, &sig));
    }

    #[test]
    fn digest_depends_on_delegatee() {
        let a = delegation_digest(&[1u8; 32], "kind=1");
        let b = delegation_digest(&[2u8; 32], "kind=1");
        assert_ne!(a, b);
    }
}
