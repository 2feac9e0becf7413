//! HMAC-SHA256 order signatures for the simulated venue.
//!
//! Not a production signature scheme: maker and venue share the secret.

use super::types::SignedOrder;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a message with a shared secret, hex-encoded.
pub fn sign_message(secret: &str, message: &str) -> String {
    // HMAC accepts keys of any length, so key setup cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check.
pub fn verify_message(secret: &str, message: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Fill in `order.signature` using the maker's secret.
pub fn sign_order(mut order: SignedOrder, secret: &str) -> SignedOrder {
    order.signature = sign_message(secret, &order.message());
    order
}
