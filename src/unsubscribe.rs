//! Signed unsubscribe links embedded in every newsletter.

use sha2::{Digest, Sha256};
use url::form_urlencoded;

pub fn unsubscribe_token(secret: &str, email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(email.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compare digests of both values so the comparison time does not depend on
/// how many leading characters of the token match.
pub fn verify_token(secret: &str, email: &str, presented: &str) -> bool {
    let expected = Sha256::digest(unsubscribe_token(secret, email).as_bytes());
    let actual = Sha256::digest(presented.trim().to_lowercase().as_bytes());
    expected == actual
}

pub fn unsubscribe_url(site_url: &str, secret: &str, email: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("email", email)
        .append_pair("token", &unsubscribe_token(secret, email))
        .finish();
    format!("{}/api/unsubscribe?{}", site_url.trim_end_matches('/'), query)
}
