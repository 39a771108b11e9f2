use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfirmationError {
    #[error("confirmation secret is empty")]
    EmptySecret,
    #[error("plan id is empty")]
    EmptyPlanId,
}

/// Issues and checks commit tokens for previously computed plans.
///
/// A token is `base64url(HMAC-SHA256(secret, plan_id))`, so only a holder of
/// the secret can mint one, and verification goes through the MAC's
/// constant-time comparison.
#[derive(Clone, Debug)]
pub struct ConfirmationSigner {
    secret: SecretString,
}

impl ConfirmationSigner {
    pub fn new(secret: SecretString) -> Result<Self, ConfirmationError> {
        if secret.expose_secret().is_empty() {
            return Err(ConfirmationError::EmptySecret);
        }
        Ok(Self { secret })
    }

    pub fn issue(&self, plan_id: &str) -> Result<String, ConfirmationError> {
        let mac = self.mac_for(plan_id)?;
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, plan_id: &str, token: &str) -> bool {
        let Ok(signature) = URL_SAFE_NO_PAD.decode(token.trim()) else {
            return false;
        };
        match self.mac_for(plan_id) {
            Ok(mac) => mac.verify_slice(&signature).is_ok(),
            Err(_) => false,
        }
    }

    fn mac_for(&self, plan_id: &str) -> Result<HmacSha256, ConfirmationError> {
        if plan_id.trim().is_empty() {
            return Err(ConfirmationError::EmptyPlanId);
        }
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| ConfirmationError::EmptySecret)?;
        mac.update(plan_id.as_bytes());
        Ok(mac)
    }
}
