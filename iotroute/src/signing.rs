use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::message::ControlMessage;
use crate::{Error, Result};

/// Attaches an integrity signature to an outgoing control message.
///
/// `json` is the message serialized with the sensor secret in its `secret`
/// field and an empty signature. Implementations set `signature` and must not
/// leave the secret in the message.
pub trait MessageSigner: Sync + Send {
    fn sign(&self, message: &mut ControlMessage, json: &str) -> Result<()>;
}

/// `signature = hex(sha256(json))`. A device verifies by putting its own secret
/// back into the message, clearing the signature and hashing the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Signer;

impl MessageSigner for Sha256Signer {
    fn sign(&self, message: &mut ControlMessage, json: &str) -> Result<()> {
        let digest = Sha256::digest(json.as_bytes());
        message.signature = hex::encode(digest);
        message.secret.clear();
        Ok(())
    }
}

/// `signature = hex(hmac_sha256(secret, json))`
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSigner;

impl MessageSigner for HmacSigner {
    fn sign(&self, message: &mut ControlMessage, json: &str) -> Result<()> {
        if message.secret.is_empty() {
            return Err(Error::routing("control-message", "cannot sign without a sensor secret"));
        }
        let mut mac = Hmac::<Sha256>::new_from_slice(message.secret.as_bytes())
            .map_err(|e| Error::InvalidArgument(format!("hmac key, {e}")))?;
        mac.update(json.as_bytes());
        message.signature = hex::encode(mac.finalize().into_bytes());
        message.secret.clear();
        Ok(())
    }
}
