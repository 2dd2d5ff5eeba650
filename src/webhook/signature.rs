use data_encoding::HEXLOWER_PERMISSIVE;
use ring::hmac;

pub const SIGNATURE_HEADER: &str = "X-Wharf-Signature";

/// `sha256=<hex>` HMAC over the exact body bytes.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    format!("sha256={}", HEXLOWER_PERMISSIVE.encode(tag.as_ref()))
}

pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(tag) = HEXLOWER_PERMISSIVE.decode(hex.as_bytes()) else {
        return false;
    };

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            sign("Jefe", b"what do ya want for nothing?"),
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verifies_only_matching_bodies() {
        let signature = sign("s3cret", b"{\"a\":1}");
        assert!(verify("s3cret", b"{\"a\":1}", &signature));
        assert!(!verify("s3cret", b"{\"a\": 1}", &signature));
        assert!(!verify("other", b"{\"a\":1}", &signature));
        assert!(!verify("s3cret", b"{\"a\":1}", "md5=abcd"));
    }
}
