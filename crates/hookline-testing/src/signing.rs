//! Request signing the way a webhook sender does it.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn hmac_hex(secret: &[u8], parts: &[&[u8]]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    hex::encode(mac.finalize().into_bytes())
}

/// Signature header value over the raw body: `sha256=<hex>`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    format!("sha256={}", hmac_hex(secret, &[body]))
}

/// Signature header value over `"{timestamp}.{body}"`.
pub fn sign_timestamped(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    let prefix = format!("{timestamp}.");
    format!("sha256={}", hmac_hex(secret, &[prefix.as_bytes(), body]))
}
