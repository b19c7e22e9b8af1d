//! In-process S3-compatible server for tests.
//!
//! Verifies every request's SigV4 signature (header or presigned), then serves
//! PUT/GET/DELETE/CopyObject and the multipart verbs from memory.

use super::s3::{extract_tag, xml_escape};
use super::signer::{
    self, ALGORITHM, Credentials, SigV4Signer, UNSIGNED_PAYLOAD, canonical_headers,
    canonical_query, sha256_hex,
};
use crate::config::S3Config;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::Response,
};
use chrono::{NaiveDateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

pub const ACCESS_KEY: &str = "fake-access-key";
pub const SECRET_KEY: &str = "fake-secret-key";
pub const BUCKET: &str = "vault";
pub const REGION: &str = "us-east-1";

#[derive(Default)]
struct FakeState {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    requests: Vec<String>,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Clone)]
pub struct FakeS3 {
    pub addr: SocketAddr,
    state: Arc<Mutex<FakeState>>,
}

impl FakeS3 {
    pub async fn spawn() -> Self {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn config(&self) -> S3Config {
        S3Config {
            endpoint: Some(format!("http://{}", self.addr)),
            region: REGION.into(),
            bucket: BUCKET.into(),
            access_key: ACCESS_KEY.into(),
            secret_key: SECRET_KEY.into(),
            use_path_style: true,
            timeout_secs: 10,
            ..S3Config::default()
        }
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn insert_object(&self, key: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), data.to_vec());
    }

    pub fn object_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().unwrap().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn has_upload(&self, upload_id: &str) -> bool {
        self.state.lock().unwrap().uploads.contains_key(upload_id)
    }

    /// Store a part as if a client had PUT it to its presigned URL.
    pub fn put_part(&self, upload_id: &str, part_number: u32, data: &[u8]) -> String {
        let mut state = self.state.lock().unwrap();
        let upload = state.uploads.get_mut(upload_id).expect("known upload");
        upload.parts.insert(part_number, data.to_vec());
        format!("\"{:x}\"", md5::compute(data))
    }

    /// `METHOD path?query` of every request received so far.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }
}

fn signer() -> SigV4Signer {
    SigV4Signer::new(
        Credentials {
            access_key: ACCESS_KEY.into(),
            secret_key: SECRET_KEY.into(),
            session_token: None,
        },
        REGION,
    )
}

fn xml_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/xml")
        .body(Body::from(body))
        .unwrap()
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    xml_response(
        status,
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{}</Code><Message>{}</Message></Error>",
            code,
            xml_escape(message)
        ),
    )
}

fn empty(status: StatusCode) -> Response {
    Response::builder().status(status).body(Body::empty()).unwrap()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Recompute the header signature from what actually arrived on the wire.
fn verify_header_signature(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    query: &[(String, String)],
    body: &[u8],
) -> Result<(), (&'static str, String)> {
    let auth = header_value(headers, "authorization")
        .ok_or(("AccessDenied", "missing authorization".to_string()))?;
    let rest = auth
        .strip_prefix(ALGORITHM)
        .ok_or(("AccessDenied", "unknown algorithm".to_string()))?;

    let mut credential = "";
    let mut signed_list = "";
    let mut signature = "";
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("Credential=") {
            credential = v;
        } else if let Some(v) = part.strip_prefix("SignedHeaders=") {
            signed_list = v;
        } else if let Some(v) = part.strip_prefix("Signature=") {
            signature = v;
        }
    }
    if !credential.starts_with(&format!("{}/", ACCESS_KEY)) {
        return Err(("InvalidAccessKeyId", credential.to_string()));
    }

    let payload_hash = header_value(headers, "x-amz-content-sha256")
        .ok_or(("AccessDenied", "missing payload hash".to_string()))?;
    if payload_hash != UNSIGNED_PAYLOAD && payload_hash != sha256_hex(body) {
        return Err(("XAmzContentSHA256Mismatch", payload_hash.to_string()));
    }
    let amz_date = header_value(headers, "x-amz-date")
        .ok_or(("AccessDenied", "missing x-amz-date".to_string()))?;
    NaiveDateTime::parse_from_str(amz_date, "%Y%m%dT%H%M%SZ")
        .map_err(|_| ("AccessDenied", "bad x-amz-date".to_string()))?;

    let mut covered = Vec::new();
    for name in signed_list.split(';') {
        let value = header_value(headers, name).unwrap_or_default();
        covered.push((name.to_string(), value.to_string()));
    }
    let (block, signed) = canonical_headers(&covered);
    let canonical = signer::canonical_request(
        method.as_str(),
        uri.path(),
        &canonical_query(query),
        &block,
        &signed,
        payload_hash,
    );
    let date_stamp = &amz_date[..8];
    let signer = signer();
    let scope = signer.credential_scope(date_stamp);
    let to_sign = signer::string_to_sign(amz_date, &scope, &canonical);
    let expected = signer
        .sign_string(date_stamp, &to_sign)
        .map_err(|e| ("AccessDenied", e.to_string()))?;
    if expected != signature {
        return Err(("SignatureDoesNotMatch", canonical));
    }
    Ok(())
}

async fn handle(
    State(state): State<Arc<Mutex<FakeState>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw_query = uri.query().unwrap_or("");
    let query: Vec<(String, String)> = url::form_urlencoded::parse(raw_query.as_bytes())
        .into_owned()
        .collect();
    state
        .lock()
        .unwrap()
        .requests
        .push(format!("{} {}?{}", method, uri.path(), raw_query));

    let host = header_value(&headers, "host").unwrap_or_default().to_string();
    let presigned = query.iter().any(|(k, _)| k == "X-Amz-Signature");
    let verdict = if presigned {
        signer()
            .verify_presigned(method.as_str(), uri.path(), &host, &query, Utc::now())
            .map_err(|e| ("AccessDenied", e.to_string()))
    } else {
        verify_header_signature(&method, &uri, &headers, &query, &body)
    };
    if let Err((code, message)) = verdict {
        return error_response(StatusCode::FORBIDDEN, code, &message);
    }

    let decoded = urlencoding::decode(uri.path())
        .map(|c| c.into_owned())
        .unwrap_or_default();
    let Some(rest) = decoded.strip_prefix(&format!("/{}/", BUCKET)) else {
        return error_response(StatusCode::NOT_FOUND, "NoSuchBucket", &decoded);
    };
    let key = rest.to_string();
    let param = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    let mut state = state.lock().unwrap();
    match method {
        Method::POST if param("uploads").is_some() => {
            let upload_id = Uuid::new_v4().simple().to_string();
            state.uploads.insert(
                upload_id.clone(),
                PendingUpload {
                    key: key.clone(),
                    parts: BTreeMap::new(),
                },
            );
            xml_response(
                StatusCode::OK,
                format!(
                    "<?xml version=\"1.0\"?><InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                    BUCKET,
                    xml_escape(&key),
                    upload_id
                ),
            )
        }
        Method::POST if param("uploadId").is_some() => {
            let upload_id = param("uploadId").unwrap_or_default();
            let Some(upload) = state.uploads.get(&upload_id) else {
                return error_response(StatusCode::NOT_FOUND, "NoSuchUpload", &upload_id);
            };
            let text = String::from_utf8_lossy(&body).to_string();
            let mut assembled = Vec::new();
            let mut last = 0u32;
            for chunk in text.split("<Part>").skip(1) {
                let number: u32 = extract_tag(chunk, "PartNumber")
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                let etag = extract_tag(chunk, "ETag").unwrap_or_default();
                if number <= last {
                    return error_response(StatusCode::BAD_REQUEST, "InvalidPartOrder", "order");
                }
                let Some(data) = upload.parts.get(&number) else {
                    return error_response(StatusCode::BAD_REQUEST, "InvalidPart", "missing");
                };
                if etag.trim_matches('"') != format!("{:x}", md5::compute(data)) {
                    return error_response(StatusCode::BAD_REQUEST, "InvalidPart", "etag");
                }
                assembled.extend_from_slice(data);
                last = number;
            }
            let key = upload.key.clone();
            let count = last;
            state.uploads.remove(&upload_id);
            let etag = format!("{:x}-{}", md5::compute(&assembled), count);
            state.objects.insert(key.clone(), assembled);
            xml_response(
                StatusCode::OK,
                format!(
                    "<?xml version=\"1.0\"?><CompleteMultipartUploadResult><Location>http://{}/{}/{}</Location><Bucket>{}</Bucket><Key>{}</Key><ETag>&quot;{}&quot;</ETag></CompleteMultipartUploadResult>",
                    host,
                    BUCKET,
                    xml_escape(&key),
                    BUCKET,
                    xml_escape(&key),
                    etag
                ),
            )
        }
        Method::PUT if param("uploadId").is_some() => {
            let upload_id = param("uploadId").unwrap_or_default();
            let number: u32 = param("partNumber").and_then(|n| n.parse().ok()).unwrap_or(0);
            let Some(upload) = state.uploads.get_mut(&upload_id) else {
                return error_response(StatusCode::NOT_FOUND, "NoSuchUpload", &upload_id);
            };
            upload.parts.insert(number, body.to_vec());
            Response::builder()
                .status(StatusCode::OK)
                .header(header::ETAG, format!("\"{:x}\"", md5::compute(&body)))
                .body(Body::empty())
                .unwrap()
        }
        Method::DELETE if param("uploadId").is_some() => {
            let upload_id = param("uploadId").unwrap_or_default();
            if state.uploads.remove(&upload_id).is_some() {
                empty(StatusCode::NO_CONTENT)
            } else {
                error_response(StatusCode::NOT_FOUND, "NoSuchUpload", &upload_id)
            }
        }
        Method::PUT => {
            if let Some(source) = header_value(&headers, "x-amz-copy-source") {
                let source = urlencoding::decode(source)
                    .map(|c| c.into_owned())
                    .unwrap_or_default();
                let source_key = source
                    .strip_prefix(&format!("/{}/", BUCKET))
                    .unwrap_or_default()
                    .to_string();
                let Some(data) = state.objects.get(&source_key).cloned() else {
                    return error_response(StatusCode::NOT_FOUND, "NoSuchKey", &source_key);
                };
                let etag = format!("{:x}", md5::compute(&data));
                state.objects.insert(key, data);
                return xml_response(
                    StatusCode::OK,
                    format!(
                        "<CopyObjectResult><ETag>&quot;{}&quot;</ETag></CopyObjectResult>",
                        etag
                    ),
                );
            }
            let etag = format!("\"{:x}\"", md5::compute(&body));
            state.objects.insert(key, body.to_vec());
            Response::builder()
                .status(StatusCode::OK)
                .header(header::ETAG, etag)
                .body(Body::empty())
                .unwrap()
        }
        Method::GET => match state.objects.get(&key) {
            Some(data) => Response::builder()
                .status(StatusCode::OK)
                .body(Body::from(data.clone()))
                .unwrap(),
            None => error_response(StatusCode::NOT_FOUND, "NoSuchKey", &key),
        },
        Method::DELETE => {
            state.objects.remove(&key);
            empty(StatusCode::NO_CONTENT)
        }
        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "method"),
    }
}
