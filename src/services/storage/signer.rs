//! AWS Signature Version 4 for S3-compatible endpoints.
//!
//! Produces either a header-based `Authorization` value for direct calls or a
//! query-string signature for presigned URLs. All canonicalization helpers are
//! public so callers (and the fake server used in tests) build byte-identical
//! signing input.

use super::StorageError;
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// SHA-256 of the empty string.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
pub const MAX_PRESIGN_SECS: u64 = 604_800;

const SERVICE: &str = "s3";
const TERMINATOR: &str = "aws4_request";
const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const DATE_STAMP_FORMAT: &str = "%Y%m%d";

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

/// A request to be signed with an `Authorization` header.
#[derive(Debug, Clone)]
pub struct HeaderRequest<'a> {
    pub method: &'a str,
    /// Already percent-encoded path, see [`encode_path`].
    pub canonical_uri: &'a str,
    pub query: &'a [(String, String)],
    /// Value of the `Host` header, including a non-default port.
    pub host: &'a str,
    /// Extra headers that must be covered by the signature.
    pub headers: &'a [(String, String)],
    /// Hex SHA-256 of the body, or [`UNSIGNED_PAYLOAD`].
    pub payload_hash: &'a str,
}

/// Headers to send, plus the signing input for diagnostics.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub headers: Vec<(String, String)>,
    pub canonical_request: String,
    pub signature: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresignError {
    #[error("presigned url is missing `{0}`")]
    Missing(&'static str),
    #[error("presigned url is malformed: {0}")]
    Malformed(String),
    #[error("presigned url has expired")]
    Expired,
    #[error("presigned url was signed for a different credential")]
    CredentialMismatch,
    #[error("presigned url signature does not match")]
    SignatureMismatch,
}

#[derive(Clone)]
pub struct SigV4Signer {
    credentials: Credentials,
    region: String,
}

impl SigV4Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// `date/region/s3/aws4_request`
    pub fn credential_scope(&self, date_stamp: &str) -> String {
        format!("{}/{}/{}/{}", date_stamp, self.region, SERVICE, TERMINATOR)
    }

    /// kDate → kRegion → kService → kSigning.
    pub fn signing_key(&self, date_stamp: &str) -> Result<Vec<u8>, StorageError> {
        let secret = format!("AWS4{}", self.credentials.secret_key);
        let k_date = hmac_sha256(secret.as_bytes(), date_stamp.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
        hmac_sha256(&k_service, TERMINATOR.as_bytes())
    }

    /// Hex HMAC of `string_to_sign` under the derived signing key.
    pub fn sign_string(
        &self,
        date_stamp: &str,
        string_to_sign: &str,
    ) -> Result<String, StorageError> {
        let key = self.signing_key(date_stamp)?;
        Ok(hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?))
    }

    /// Sign a direct request. The returned headers include `host`,
    /// `x-amz-date`, `x-amz-content-sha256`, the session token when present,
    /// the caller's extra headers and finally `authorization`.
    pub fn sign_headers(
        &self,
        request: &HeaderRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<SignedHeaders, StorageError> {
        let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
        let date_stamp = now.format(DATE_STAMP_FORMAT).to_string();

        let mut headers: Vec<(String, String)> = vec![
            ("host".into(), request.host.to_string()),
            ("x-amz-date".into(), amz_date.clone()),
            (
                "x-amz-content-sha256".into(),
                request.payload_hash.to_string(),
            ),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".into(), token.clone()));
        }
        headers.extend(
            request
                .headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone())),
        );

        let (canonical_headers, signed_headers) = canonical_headers(&headers);
        let canonical_request = canonical_request(
            request.method,
            request.canonical_uri,
            &canonical_query(request.query),
            &canonical_headers,
            &signed_headers,
            request.payload_hash,
        );
        let scope = self.credential_scope(&date_stamp);
        let to_sign = string_to_sign(&amz_date, &scope, &canonical_request);
        let signature = self.sign_string(&date_stamp, &to_sign)?;

        headers.push((
            "authorization".into(),
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, self.credentials.access_key, scope, signed_headers, signature
            ),
        ));

        Ok(SignedHeaders {
            headers,
            canonical_request,
            signature,
        })
    }

    /// Build the full query string of a presigned URL, signature last.
    /// Only `host` is signed and the payload is [`UNSIGNED_PAYLOAD`].
    pub fn presign(
        &self,
        method: &str,
        canonical_uri: &str,
        host: &str,
        query: &[(String, String)],
        expires_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<String, StorageError> {
        let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
        let date_stamp = now.format(DATE_STAMP_FORMAT).to_string();
        let scope = self.credential_scope(&date_stamp);
        let expires = expires_secs.clamp(1, MAX_PRESIGN_SECS);

        let mut params = query.to_vec();
        params.push(("X-Amz-Algorithm".into(), ALGORITHM.into()));
        params.push((
            "X-Amz-Credential".into(),
            format!("{}/{}", self.credentials.access_key, scope),
        ));
        params.push(("X-Amz-Date".into(), amz_date.clone()));
        params.push(("X-Amz-Expires".into(), expires.to_string()));
        params.push(("X-Amz-SignedHeaders".into(), "host".into()));
        if let Some(token) = &self.credentials.session_token {
            params.push(("X-Amz-Security-Token".into(), token.clone()));
        }

        let signature = self.presigned_signature(method, canonical_uri, host, &params, &amz_date)?;
        params.push(("X-Amz-Signature".into(), signature));
        Ok(canonical_query(&params))
    }

    fn presigned_signature(
        &self,
        method: &str,
        canonical_uri: &str,
        host: &str,
        params: &[(String, String)],
        amz_date: &str,
    ) -> Result<String, StorageError> {
        let date_stamp = amz_date.get(..8).unwrap_or(amz_date);
        let (canonical_headers, signed_headers) =
            canonical_headers(&[("host".to_string(), host.to_string())]);
        let canonical_request = canonical_request(
            method,
            canonical_uri,
            &canonical_query(params),
            &canonical_headers,
            &signed_headers,
            UNSIGNED_PAYLOAD,
        );
        let scope = self.credential_scope(date_stamp);
        let to_sign = string_to_sign(amz_date, &scope, &canonical_request);
        self.sign_string(date_stamp, &to_sign)
    }

    /// Check a presigned request the way an S3 endpoint would: credential,
    /// signature over the remaining parameters, then the expiry window.
    pub fn verify_presigned(
        &self,
        method: &str,
        canonical_uri: &str,
        host: &str,
        query: &[(String, String)],
        now: DateTime<Utc>,
    ) -> Result<(), PresignError> {
        let lookup = |name: &'static str| {
            query
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
                .ok_or(PresignError::Missing(name))
        };

        let signature = lookup("X-Amz-Signature")?;
        let amz_date = lookup("X-Amz-Date")?;
        let credential = lookup("X-Amz-Credential")?;
        let expires: i64 = lookup("X-Amz-Expires")?
            .parse()
            .map_err(|_| PresignError::Malformed("X-Amz-Expires".into()))?;

        let signed_at = NaiveDateTime::parse_from_str(amz_date, AMZ_DATE_FORMAT)
            .map_err(|_| PresignError::Malformed("X-Amz-Date".into()))?
            .and_utc();
        let expected_credential = format!(
            "{}/{}",
            self.credentials.access_key,
            self.credential_scope(&signed_at.format(DATE_STAMP_FORMAT).to_string())
        );
        if credential != expected_credential {
            return Err(PresignError::CredentialMismatch);
        }

        let params: Vec<(String, String)> = query
            .iter()
            .filter(|(key, _)| key != "X-Amz-Signature")
            .cloned()
            .collect();
        let expected = self
            .presigned_signature(method, canonical_uri, host, &params, amz_date)
            .map_err(|err| PresignError::Malformed(err.to_string()))?;
        if expected != signature {
            return Err(PresignError::SignatureMismatch);
        }

        if now > signed_at + chrono::Duration::seconds(expires) {
            return Err(PresignError::Expired);
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| StorageError::Signing(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// RFC 3986 percent-encoding: everything but `A-Z a-z 0-9 - _ . ~`.
pub fn uri_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Encode each path segment, keeping the slashes between them.
pub fn encode_path(path: &str) -> String {
    path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// Leading slash, repeated slashes collapsed.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    normalized.push('/');
    for ch in path.trim_start_matches('/').chars() {
        if ch == '/' && normalized.ends_with('/') {
            continue;
        }
        normalized.push(ch);
    }
    normalized
}

/// Keys and values encoded, pairs sorted by encoded key then value.
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| (uri_encode(key), uri_encode(value)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

/// Returns the canonical header block (one `name:value\n` line per header)
/// and the `;`-joined signed header list.
pub fn canonical_headers(headers: &[(String, String)]) -> (String, String) {
    let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
        merged
            .entry(name.trim().to_ascii_lowercase())
            .or_default()
            .push(collapsed);
    }

    let mut block = String::new();
    for (name, values) in &merged {
        block.push_str(name);
        block.push(':');
        block.push_str(&values.join(","));
        block.push('\n');
    }
    let signed = merged.keys().cloned().collect::<Vec<_>>().join(";");
    (block, signed)
}

pub fn canonical_request(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    canonical_headers: &str,
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
    )
}

pub fn string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    )
}
