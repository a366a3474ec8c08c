use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// URL-safe base64 without padding, as used for token segments.
pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn base64url_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(data)
}
