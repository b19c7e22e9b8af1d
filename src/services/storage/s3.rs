//! S3-compatible backend speaking the REST protocol directly, signed with SigV4.

use super::{
    ByteStream, StorageError, StorageResult,
    signer::{
        Credentials, EMPTY_PAYLOAD_SHA256, HeaderRequest, SigV4Signer, canonical_query,
        encode_path, normalize_path, uri_encode,
    },
};
use crate::{
    config::S3Config,
    models::object::{PutOptions, StoredObject},
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use reqwest::{Method, header};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{fs::File, io::AsyncReadExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Where a request goes and what gets signed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub scheme: &'static str,
    /// `Host` header value, with the port when it is not the scheme default.
    pub host: String,
    /// Normalized, percent-encoded path.
    pub canonical_uri: String,
}

impl RequestTarget {
    pub fn url(&self, query: &str) -> String {
        if query.is_empty() {
            format!("{}://{}{}", self.scheme, self.host, self.canonical_uri)
        } else {
            format!("{}://{}{}?{}", self.scheme, self.host, self.canonical_uri, query)
        }
    }
}

/// Request body variants. Files are streamed with an explicit length.
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    File { file: File, len: u64 },
}

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: Option<u16>,
    base_path: String,
}

/// Low-level signed HTTP access to one bucket.
pub struct S3Client {
    http: reqwest::Client,
    signer: SigV4Signer,
    config: S3Config,
    endpoint: Option<Endpoint>,
}

impl S3Client {
    pub fn new(config: S3Config) -> StorageResult<Self> {
        for (name, value) in [
            ("bucket", &config.bucket),
            ("access_key", &config.access_key),
            ("secret_key", &config.secret_key),
        ] {
            if value.trim().is_empty() {
                return Err(StorageError::Config(format!("s3 {} is required", name)));
            }
        }

        let endpoint = match config.endpoint.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(parse_endpoint(raw, config.use_https())?),
            _ => None,
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        let signer = SigV4Signer::new(
            Credentials {
                access_key: config.access_key.clone(),
                secret_key: config.secret_key.clone(),
                session_token: config.session_token.clone(),
            },
            config.region.clone(),
        );

        Ok(Self {
            http,
            signer,
            config,
            endpoint,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn signer(&self) -> &SigV4Signer {
        &self.signer
    }

    /// Storage key with the configured prefix applied.
    pub fn prefixed_key(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", prefix, key)
        }
    }

    /// Path-style: `base/bucket/key` on the endpoint host.
    /// Virtual-hosted: `base/key` on `bucket.host`.
    /// No endpoint: AWS `bucket.s3.region.amazonaws.com`.
    pub fn target(&self, key: &str) -> RequestTarget {
        let encoded_key = encode_path(&self.prefixed_key(key));
        let scheme = if self.config.use_https() { "https" } else { "http" };

        match &self.endpoint {
            Some(endpoint) => {
                let port_suffix = match endpoint.port {
                    Some(port) if !is_default_port(scheme, port) => format!(":{}", port),
                    _ => String::new(),
                };
                if self.config.use_path_style {
                    RequestTarget {
                        scheme,
                        host: format!("{}{}", endpoint.host, port_suffix),
                        canonical_uri: normalize_path(&format!(
                            "{}/{}/{}",
                            endpoint.base_path,
                            uri_encode(&self.config.bucket),
                            encoded_key
                        )),
                    }
                } else {
                    RequestTarget {
                        scheme,
                        host: format!("{}.{}{}", self.config.bucket, endpoint.host, port_suffix),
                        canonical_uri: normalize_path(&format!(
                            "{}/{}",
                            endpoint.base_path, encoded_key
                        )),
                    }
                }
            }
            None => RequestTarget {
                scheme,
                host: format!(
                    "{}.s3.{}.amazonaws.com",
                    self.config.bucket, self.config.region
                ),
                canonical_uri: normalize_path(&format!("/{}", encoded_key)),
            },
        }
    }

    /// Sign and send one request. Non-2xx responses become errors; a 404 is
    /// reported as [`StorageError::NotFound`].
    pub async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: RequestBody,
        payload_hash: &str,
    ) -> StorageResult<reqwest::Response> {
        let target = self.target(key);
        let signed = self.signer.sign_headers(
            &HeaderRequest {
                method: method.as_str(),
                canonical_uri: &target.canonical_uri,
                query,
                host: &target.host,
                headers,
                payload_hash,
            },
            Utc::now(),
        )?;
        debug!(
            "s3 {} {} canonical request:\n{}",
            method, target.canonical_uri, signed.canonical_request
        );

        let url = target.url(&canonical_query(query));
        let sends_body = method == Method::PUT || method == Method::POST;
        let mut request = self.http.request(method, url);
        for (name, value) in &signed.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match body {
            RequestBody::Empty if sends_body => request.body(Bytes::new()),
            RequestBody::Empty => request,
            RequestBody::Bytes(bytes) => request.body(bytes),
            RequestBody::File { file, len } => request
                .header(header::CONTENT_LENGTH, len)
                .body(reqwest::Body::wrap_stream(ReaderStream::new(file))),
        };

        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Err(backend_error(status, key, &text))
    }

    /// Full presigned URL for `method` on `key`.
    pub fn presigned_url(
        &self,
        method: &str,
        key: &str,
        query: &[(String, String)],
        ttl_secs: u64,
    ) -> StorageResult<String> {
        let target = self.target(key);
        let query = self.signer.presign(
            method,
            &target.canonical_uri,
            &target.host,
            query,
            ttl_secs,
            Utc::now(),
        )?;
        Ok(target.url(&query))
    }
}

fn parse_endpoint(raw: &str, use_https: bool) -> StorageResult<Endpoint> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("{}://{}", if use_https { "https" } else { "http" }, raw)
    };
    let url = url::Url::parse(&with_scheme)
        .map_err(|err| StorageError::Config(format!("invalid s3 endpoint `{}`: {}", raw, err)))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| StorageError::Config(format!("s3 endpoint `{}` has no host", raw)))?;
    Ok(Endpoint {
        host: host.to_string(),
        port: url.port(),
        base_path: url.path().trim_end_matches('/').to_string(),
    })
}

fn is_default_port(scheme: &str, port: u16) -> bool {
    (scheme == "https" && port == 443) || (scheme == "http" && port == 80)
}

/// Turn an error response into a [`StorageError`], pulling `<Code>` and
/// `<Message>` out of the XML body when present.
pub fn backend_error(status: u16, key: &str, body: &str) -> StorageError {
    if status == 404 {
        return StorageError::NotFound(key.to_string());
    }
    let code = extract_tag(body, "Code").unwrap_or_else(|| format!("HTTP{}", status));
    let mut message = extract_tag(body, "Message").unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            "no error details".to_string()
        } else {
            trimmed.chars().take(200).collect()
        }
    });
    if status == 403 {
        message.push_str(" (check the access key, secret key, bucket permissions and clock skew)");
    }
    StorageError::Backend {
        status,
        code,
        message,
    }
}

/// Text of the first `<tag>…</tag>` element, unescaped and trimmed.
pub fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml_unescape(xml[start..end].trim()))
}

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn xml_unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// SHA-256 hex and length of a file, read in chunks.
pub async fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut len = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), len))
}

/// Object operations on top of [`S3Client`].
#[derive(Clone)]
pub struct S3Storage {
    client: Arc<S3Client>,
}

impl S3Storage {
    pub fn new(client: Arc<S3Client>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<S3Client> {
        &self.client
    }

    /// PUT the file, then remove the local source.
    pub async fn put(
        &self,
        key: &str,
        source: &Path,
        opts: &PutOptions,
    ) -> StorageResult<StoredObject> {
        let (payload_hash, len) = hash_file(source).await?;
        let file = File::open(source).await?;
        let mut headers = Vec::new();
        if let Some(content_type) = opts.content_type.as_deref() {
            headers.push(("content-type".to_string(), content_type.to_string()));
        }

        let response = self
            .client
            .send(
                Method::PUT,
                key,
                &[],
                &headers,
                RequestBody::File { file, len },
                &payload_hash,
            )
            .await?;
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        if let Err(err) = tokio::fs::remove_file(source).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("could not remove upload source {}: {}", source.display(), err);
            }
        }

        Ok(StoredObject {
            disk: "s3".into(),
            key: key.to_string(),
            bytes: len,
            extra: json!({ "bucket": self.client.bucket(), "etag": etag }),
        })
    }

    pub async fn read_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let response = self
            .client
            .send(
                Method::GET,
                key,
                &[],
                &[],
                RequestBody::Empty,
                EMPTY_PAYLOAD_SHA256,
            )
            .await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed())
    }

    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .send(
                Method::DELETE,
                key,
                &[],
                &[],
                RequestBody::Empty,
                EMPTY_PAYLOAD_SHA256,
            )
            .await
        {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// Server-side CopyObject. A missing source yields `false`.
    pub async fn copy(&self, src_key: &str, dst_key: &str) -> StorageResult<bool> {
        let source = format!(
            "/{}/{}",
            uri_encode(self.client.bucket()),
            encode_path(&self.client.prefixed_key(src_key))
        );
        let headers = vec![("x-amz-copy-source".to_string(), source)];
        let response = match self
            .client
            .send(
                Method::PUT,
                dst_key,
                &[],
                &headers,
                RequestBody::Empty,
                EMPTY_PAYLOAD_SHA256,
            )
            .await
        {
            Ok(response) => response,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };

        // CopyObject can fail after the 200 status line has been sent.
        let body = response.text().await?;
        if body.contains("<Error>") {
            return Err(backend_error(200, dst_key, &body));
        }
        Ok(true)
    }

    pub fn presign(&self, key: &str, ttl_secs: u64) -> StorageResult<String> {
        self.client.presigned_url("GET", key, &[], ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::{fake_s3::FakeS3, local::collect_stream};
    use tempfile::TempDir;

    fn client_with(endpoint: Option<&str>, path_style: bool, prefix: &str) -> S3Client {
        S3Client::new(S3Config {
            endpoint: endpoint.map(String::from),
            region: "cn-default".into(),
            bucket: "vault".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            prefix: prefix.into(),
            use_path_style: path_style,
            ..S3Config::default()
        })
        .unwrap()
    }

    #[test]
    fn test_path_style_target() {
        let client = client_with(Some("http://minio.local:9000/base/"), true, "/tenant/");
        let target = client.target("customer/1/a b.txt");
        assert_eq!(target.host, "minio.local:9000");
        assert_eq!(target.canonical_uri, "/base/vault/tenant/customer/1/a%20b.txt");
        assert_eq!(
            target.url(""),
            "http://minio.local:9000/base/vault/tenant/customer/1/a%20b.txt"
        );
    }

    #[test]
    fn test_virtual_host_target_drops_default_port() {
        let client = client_with(Some("https://oss.example.com:443"), false, "");
        let target = client.target("/k//x.png");
        assert_eq!(target.scheme, "https");
        assert_eq!(target.host, "vault.oss.example.com");
        assert_eq!(target.canonical_uri, "/k/x.png");
    }

    #[test]
    fn test_endpoint_without_scheme_and_aws_default() {
        let client = client_with(Some("cos.example.com"), false, "");
        assert_eq!(client.target("a").host, "vault.cos.example.com");
        assert_eq!(client.target("a").scheme, "https");

        let aws = client_with(None, false, "");
        assert_eq!(aws.target("a").host, "vault.s3.cn-default.amazonaws.com");
    }

    #[test]
    fn test_backend_error_parsing() {
        let body = "<Error><Code>AccessDenied</Code><Message>Access &amp; denied</Message></Error>";
        match backend_error(403, "k", body) {
            StorageError::Backend {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 403);
                assert_eq!(code, "AccessDenied");
                assert!(message.starts_with("Access & denied"));
                assert!(message.contains("clock skew"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(backend_error(404, "k", ""), StorageError::NotFound(_)));
        match backend_error(500, "k", "") {
            StorageError::Backend { code, message, .. } => {
                assert_eq!(code, "HTTP500");
                assert_eq!(message, "no error details");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn source_file(dir: &TempDir, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(format!("src-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_put_read_copy_delete_roundtrip() {
        let fake = FakeS3::spawn().await;
        let storage = S3Storage::new(Arc::new(S3Client::new(fake.config()).unwrap()));
        let dir = TempDir::new().unwrap();
        let source = source_file(&dir, b"quarterly numbers").await;

        let stored = storage
            .put(
                "customer/7/0102-acme/customer-files/report 1.pdf",
                &source,
                &PutOptions {
                    content_type: Some("application/pdf".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.bytes, 17);
        assert_eq!(stored.disk, "s3");
        assert!(!source.exists());
        assert_eq!(
            fake.object("customer/7/0102-acme/customer-files/report 1.pdf")
                .as_deref(),
            Some(&b"quarterly numbers"[..])
        );

        let body = collect_stream(
            storage
                .read_stream("customer/7/0102-acme/customer-files/report 1.pdf")
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(body, b"quarterly numbers");

        assert!(
            storage
                .copy(
                    "customer/7/0102-acme/customer-files/report 1.pdf",
                    "customer/7/0102-acme/customer-files/renamed.pdf"
                )
                .await
                .unwrap()
        );
        assert!(!storage.copy("missing", "elsewhere").await.unwrap());

        assert!(
            storage
                .delete("customer/7/0102-acme/customer-files/report 1.pdf")
                .await
                .unwrap()
        );
        assert!(
            fake.object("customer/7/0102-acme/customer-files/report 1.pdf")
                .is_none()
        );
        assert!(
            fake.object("customer/7/0102-acme/customer-files/renamed.pdf")
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_presigned_get_is_accepted() {
        let fake = FakeS3::spawn().await;
        let storage = S3Storage::new(Arc::new(S3Client::new(fake.config()).unwrap()));
        fake.insert_object("docs/a.txt", b"abc");

        let url = storage.presign("docs/a.txt", 300).unwrap();
        let response = reqwest::get(&url).await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn test_wrong_secret_is_backend_error() {
        let fake = FakeS3::spawn().await;
        let mut config = fake.config();
        config.secret_key = "wrong".into();
        let storage = S3Storage::new(Arc::new(S3Client::new(config).unwrap()));

        match storage.read_stream("any").await {
            Err(StorageError::Backend { status, code, .. }) => {
                assert_eq!(status, 403);
                assert_eq!(code, "SignatureDoesNotMatch");
            }
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("expected failure"),
        }
    }
}
