//! Multipart upload orchestration against the S3-compatible backend.
//!
//! Initiate → (client PUTs parts to presigned URLs, any order) → Complete,
//! or Abort. Part bytes never pass through this service.

use crate::{
    models::multipart::{CompletedPart, CompletedUpload, UploadSession},
    services::storage::{
        S3Client, StorageError, StorageResult,
        s3::{RequestBody, backend_error, extract_tag, xml_escape},
        signer::{UNSIGNED_PAYLOAD, sha256_hex},
    },
};
use bytes::Bytes;
use reqwest::Method;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info};

/// Highest part number S3 accepts.
pub const MAX_PART_NUMBER: u32 = 10_000;

#[derive(Clone)]
pub struct MultipartUploader {
    client: Arc<S3Client>,
    part_url_ttl_secs: u64,
}

impl MultipartUploader {
    pub fn new(client: Arc<S3Client>, part_url_ttl_secs: u64) -> Self {
        Self {
            client,
            part_url_ttl_secs,
        }
    }

    /// CreateMultipartUpload; returns the backend's upload id.
    pub async fn initiate(&self, key: &str, content_type: &str) -> StorageResult<String> {
        let headers = vec![("content-type".to_string(), content_type.to_string())];
        let response = self
            .client
            .send(
                Method::POST,
                key,
                &[("uploads".to_string(), String::new())],
                &headers,
                RequestBody::Empty,
                UNSIGNED_PAYLOAD,
            )
            .await?;
        let body = response.text().await?;
        match extract_tag(&body, "UploadId") {
            Some(upload_id) if !upload_id.is_empty() => {
                debug!("initiated multipart upload {} for {}", upload_id, key);
                Ok(upload_id)
            }
            _ => Err(StorageError::Backend {
                status: 200,
                code: "MissingUploadId".into(),
                message: "CreateMultipartUpload response carried no UploadId".into(),
            }),
        }
    }

    /// Initiate and describe the session for a file of `size` bytes.
    pub async fn open_session(
        &self,
        key: &str,
        content_type: &str,
        size: u64,
        part_size: u64,
    ) -> StorageResult<UploadSession> {
        let total_parts = total_parts(size, part_size)?;
        let upload_id = self.initiate(key, content_type).await?;
        Ok(UploadSession {
            storage_key: key.to_string(),
            upload_id,
            content_type: content_type.to_string(),
            part_size,
            total_parts,
        })
    }

    /// Presigned PUT URL for one part. `ttl_secs` defaults to the configured TTL.
    pub fn part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl_secs: Option<u64>,
    ) -> StorageResult<String> {
        if upload_id.trim().is_empty() {
            return Err(StorageError::InvalidRequest("upload id is required".into()));
        }
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(StorageError::InvalidRequest(format!(
                "part number must be between 1 and {}",
                MAX_PART_NUMBER
            )));
        }
        let query = vec![
            ("partNumber".to_string(), part_number.to_string()),
            ("uploadId".to_string(), upload_id.to_string()),
        ];
        self.client.presigned_url(
            "PUT",
            key,
            &query,
            ttl_secs.unwrap_or(self.part_url_ttl_secs),
        )
    }

    /// Presigned PUT URL for uploading a small object in one request.
    pub fn single_put_url(&self, key: &str, ttl_secs: Option<u64>) -> StorageResult<String> {
        self.client
            .presigned_url("PUT", key, &[], ttl_secs.unwrap_or(self.part_url_ttl_secs))
    }

    /// CompleteMultipartUpload. The part list is checked and sorted before
    /// anything is sent; the response must carry an ETag.
    pub async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        mut parts: Vec<CompletedPart>,
        expected_parts: Option<u32>,
    ) -> StorageResult<CompletedUpload> {
        validate_parts(&mut parts, expected_parts)?;
        let body = completion_body(&parts);
        let payload_hash = sha256_hex(body.as_bytes());
        let headers = vec![("content-type".to_string(), "application/xml".to_string())];

        let response = self
            .client
            .send(
                Method::POST,
                key,
                &[("uploadId".to_string(), upload_id.to_string())],
                &headers,
                RequestBody::Bytes(Bytes::from(body)),
                &payload_hash,
            )
            .await?;
        let text = response.text().await?;
        if text.contains("<Error>") {
            return Err(backend_error(200, key, &text));
        }

        let etag = extract_tag(&text, "ETag")
            .map(|etag| etag.trim_matches('"').to_string())
            .filter(|etag| !etag.is_empty())
            .ok_or_else(|| StorageError::Backend {
                status: 200,
                code: "MissingETag".into(),
                message: "CompleteMultipartUpload response carried no ETag".into(),
            })?;
        let location = extract_tag(&text, "Location").filter(|l| !l.is_empty());

        info!(
            "completed multipart upload {} for {} ({} parts)",
            upload_id,
            key,
            parts.len()
        );
        Ok(CompletedUpload { etag, location })
    }

    /// AbortMultipartUpload. An unknown or already finished session is not an error.
    pub async fn abort(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        match self
            .client
            .send(
                Method::DELETE,
                key,
                &[("uploadId".to_string(), upload_id.to_string())],
                &[],
                RequestBody::Empty,
                UNSIGNED_PAYLOAD,
            )
            .await
        {
            Ok(_) => {
                info!("aborted multipart upload {} for {}", upload_id, key);
                Ok(())
            }
            Err(StorageError::NotFound(_)) => {
                debug!("multipart upload {} already gone", upload_id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// `ceil(size / part_size)`, never less than one part.
pub fn total_parts(size: u64, part_size: u64) -> StorageResult<u32> {
    if part_size == 0 {
        return Err(StorageError::InvalidRequest("part size must be positive".into()));
    }
    let parts = size.div_ceil(part_size).max(1);
    u32::try_from(parts)
        .ok()
        .filter(|parts| *parts <= MAX_PART_NUMBER)
        .ok_or_else(|| {
            StorageError::InvalidRequest(format!(
                "{} bytes needs {} parts of {} bytes, above the limit of {}",
                size, parts, part_size, MAX_PART_NUMBER
            ))
        })
}

/// Sort parts and require numbers `1..=n` without gaps, duplicates or empty ETags.
pub fn validate_parts(parts: &mut [CompletedPart], expected: Option<u32>) -> StorageResult<()> {
    if parts.is_empty() {
        return Err(StorageError::InvalidRequest("no parts to complete".into()));
    }
    parts.sort_by_key(|part| part.part_number);

    let mut seen = HashSet::new();
    for (index, part) in parts.iter().enumerate() {
        if !seen.insert(part.part_number) {
            return Err(StorageError::InvalidRequest(format!(
                "part {} listed twice",
                part.part_number
            )));
        }
        if part.part_number as usize != index + 1 {
            return Err(StorageError::InvalidRequest(format!(
                "part {} is missing",
                index + 1
            )));
        }
        if part.etag.trim().trim_matches('"').is_empty() {
            return Err(StorageError::InvalidRequest(format!(
                "part {} has no ETag",
                part.part_number
            )));
        }
    }

    if let Some(expected) = expected {
        if parts.len() as u32 != expected {
            return Err(StorageError::InvalidRequest(format!(
                "expected {} parts, got {}",
                expected,
                parts.len()
            )));
        }
    }
    Ok(())
}

pub fn completion_body(parts: &[CompletedPart]) -> String {
    let mut xml =
        String::from(r#"<?xml version="1.0" encoding="UTF-8"?><CompleteMultipartUpload>"#);
    for part in parts {
        xml.push_str("<Part>");
        xml.push_str(&format!("<PartNumber>{}</PartNumber>", part.part_number));
        xml.push_str(&format!("<ETag>{}</ETag>", xml_escape(part.etag.trim())));
        xml.push_str("</Part>");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}
