//! HTTP digest authentication against the device's `/stream` endpoint.

use md5::{Digest, Md5};

use crate::constants::{DIGEST_NONCE_COUNT, STREAM_PATH};
use crate::error::{AuthFailure, Result};
use crate::headers::parse_params;

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Parameters of a `WWW-Authenticate: Digest ...` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: String,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Result<Self> {
        let mut params = parse_params(header);
        let realm = params.remove("realm").ok_or(AuthFailure::ChallengeMissing)?;
        let nonce = params.remove("nonce").ok_or(AuthFailure::ChallengeMissing)?;
        Ok(Self {
            realm,
            nonce,
            qop: params.remove("qop").unwrap_or_else(|| "auth".to_string()),
            algorithm: params.remove("algorithm"),
            opaque: params.remove("opaque"),
        })
    }

    /// Value of the `Authorization` header answering this challenge.
    ///
    /// `secret` is the hashed cloud password, which the device uses in place
    /// of a clear-text password.
    pub fn authorization(&self, username: &str, secret: &str, cnonce: &str) -> String {
        let response = digest_response(&DigestInput {
            username,
            realm: &self.realm,
            secret,
            method: "POST",
            uri: STREAM_PATH,
            nonce: &self.nonce,
            nc: DIGEST_NONCE_COUNT,
            cnonce,
            qop: &self.qop,
        });
        let mut header = format!(
            "Digest username=\"{username}\",realm=\"{}\",uri=\"{STREAM_PATH}\",algorithm=MD5,nonce=\"{}\",nc={DIGEST_NONCE_COUNT},cnonce=\"{cnonce}\",qop={},response=\"{response}\"",
            self.realm, self.nonce, self.qop,
        );
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(",opaque=\"{opaque}\""));
        }
        header
    }
}

pub struct DigestInput<'a> {
    pub username: &'a str,
    pub realm: &'a str,
    pub secret: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    pub nonce: &'a str,
    pub nc: &'a str,
    pub cnonce: &'a str,
    pub qop: &'a str,
}

/// `MD5(HA1:nonce:nc:cnonce:qop:HA2)` with `HA1 = MD5(user:realm:secret)`
/// and `HA2 = MD5(method:uri)`, all lower-case hex
pub fn digest_response(d: &DigestInput<'_>) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", d.username, d.realm, d.secret));
    let ha2 = md5_hex(&format!("{}:{}", d.method, d.uri));
    md5_hex(&format!("{ha1}:{}:{}:{}:{}:{ha2}", d.nonce, d.nc, d.cnonce, d.qop))
}

/// Random client nonce
pub fn generate_cnonce() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn rfc2617_example() {
        let response = digest_response(&DigestInput {
            username: "Mufasa",
            realm: "testrealm@host.com",
            secret: "Circle Of Life",
            method: "GET",
            uri: "/dir/index.html",
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            nc: "00000001",
            cnonce: "0a4f113b",
            qop: "auth",
        });
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn authorization_header_shape() {
        let ch = DigestChallenge::parse(r#"Digest realm="IPC",nonce="n0",qop="auth",opaque="op""#).unwrap();
        let header = ch.authorization("admin", "HASH", "c0ffee");
        let params = parse_params(&header);
        assert!(header.starts_with("Digest "));
        assert_eq!(params["uri"], "/stream");
        assert_eq!(params["nc"], "00000001");
        assert_eq!(params["cnonce"], "c0ffee");
        assert_eq!(params["opaque"], "op");
        let expected = digest_response(&DigestInput {
            username: "admin",
            realm: "IPC",
            secret: "HASH",
            method: "POST",
            uri: "/stream",
            nonce: "n0",
            nc: "00000001",
            cnonce: "c0ffee",
            qop: "auth",
        });
        assert_eq!(params["response"], expected);
    }

    #[test]
    fn challenge_without_nonce() {
        let err = DigestChallenge::parse(r#"Digest realm="IPC""#).unwrap_err();
        assert!(matches!(err, Error::Authentication(AuthFailure::ChallengeMissing)));
    }

    #[test]
    fn cnonce_is_random_hex() {
        let a = generate_cnonce();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, generate_cnonce());
    }
}
