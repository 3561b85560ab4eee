//! AWS Signature Version 4 for header-authenticated requests.
//!
//! Only what the queue backend needs: a single POST to the service root with
//! a JSON body, signed over `content-type`, `host`, `x-amz-date`,
//! `x-amz-target` and, for temporary credentials, `x-amz-security-token`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
    }
}

/// Headers to attach to a signed request, `Authorization` included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub headers: Vec<(String, String)>,
}

impl SignedHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Signs requests for one service in one region.
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
    region: String,
    service: String,
}

impl Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: service.into(),
        }
    }

    /// Sign a `POST /` with the given extra headers (lowercase names) and body.
    pub fn sign_post(
        &self,
        host: &str,
        headers: &[(&str, &str)],
        body: &[u8],
        now: DateTime<Utc>,
    ) -> SignedHeaders {
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);

        let mut canonical: BTreeMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        canonical.insert("host".into(), host.to_string());
        canonical.insert("x-amz-date".into(), amz_date.clone());
        if let Some(token) = &self.credentials.session_token {
            canonical.insert("x-amz-security-token".into(), token.clone());
        }

        let canonical_headers: String = canonical
            .iter()
            .fold(String::new(), |mut out, (k, v)| {
                let _ = writeln!(out, "{}:{}", k, v);
                out
            });
        let signed_headers = canonical.keys().cloned().collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "POST\n/\n\n{}\n{}\n{}",
            canonical_headers,
            signed_headers,
            hex_sha256(body)
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signature = calculate_signature(
            &self.credentials.secret_access_key,
            &date,
            &self.region,
            &self.service,
            &string_to_sign,
        );

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.credentials.access_key_id, scope, signed_headers, signature
        );

        // `host` is set by the HTTP client from the URL.
        let mut out: Vec<(String, String)> = canonical
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out.push(("authorization".into(), authorization));
        SignedHeaders { headers: out }
    }
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn calculate_signature(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
    string_to_sign: &str,
) -> String {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signer(token: Option<&str>) -> Signer {
        Signer::new(
            Credentials {
                access_key_id: "AKIDEXAMPLE".into(),
                secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
                session_token: token.map(String::from),
            },
            "us-east-1",
            "sqs",
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_authorization_header_shape() {
        let signed = signer(None).sign_post(
            "sqs.us-east-1.amazonaws.com",
            &[
                ("content-type", "application/x-amz-json-1.0"),
                ("x-amz-target", "AmazonSQS.SendMessage"),
            ],
            b"{}",
            now(),
        );

        let auth = signed.get("authorization").unwrap();
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260201/us-east-1/sqs/aws4_request, "
        ));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-date;x-amz-target, "));
        let signature = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(signed.get("x-amz-date"), Some("20260201T123000Z"));
        assert!(signed.get("host").is_none());
    }

    #[test]
    fn test_signature_depends_on_body() {
        let s = signer(None);
        let a = s.sign_post("h", &[], b"{\"a\":1}", now());
        let b = s.sign_post("h", &[], b"{\"a\":2}", now());
        let a_again = s.sign_post("h", &[], b"{\"a\":1}", now());
        assert_ne!(a.get("authorization"), b.get("authorization"));
        assert_eq!(a, a_again);
    }

    #[test]
    fn test_session_token_is_signed() {
        let signed = signer(Some("token-1")).sign_post("h", &[], b"", now());
        assert_eq!(signed.get("x-amz-security-token"), Some("token-1"));
        assert!(signed
            .get("authorization")
            .unwrap()
            .contains("SignedHeaders=host;x-amz-date;x-amz-security-token,"));
    }

    #[test]
    fn test_hex_sha256_empty() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
