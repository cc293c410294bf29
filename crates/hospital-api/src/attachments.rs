//! Attachment handling for form submissions.
//!
//! File inputs arrive inline as base64 inside the JSON body. Each one is checked,
//! decoded, verified against its declared size and written to blob storage. In the
//! stored form data it is replaced by a [`StoredFile`] reference. A file that fails any
//! step keeps its metadata without a path; the submission itself still goes through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::join_all;
use hospital_common::http::UpstreamError;
use hospital_common::supabase::SupabaseClient;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::StoredFile;
use crate::rate_limit::now_ms;
use crate::validate::{
    is_file_descriptor, sanitize_file_name, validate_file_size, validate_file_type,
    ValidationError,
};

/// Every attachment lives under this prefix; downloads outside it are refused.
pub const ATTACHMENT_PREFIX: &str = "form-submissions/";

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), UpstreamError>;

    async fn signed_url(&self, path: &str, expires_in: Duration) -> Result<String, UpstreamError>;
}

#[async_trait]
impl BlobStore for SupabaseClient {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), UpstreamError> {
        self.upload_object(path, bytes, content_type).await
    }

    async fn signed_url(&self, path: &str, expires_in: Duration) -> Result<String, UpstreamError> {
        self.create_signed_url(path, expires_in.as_secs()).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("decoded size {actual} does not match declared size {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("upload failed: {0}")]
    Upload(#[from] UpstreamError),
}

/// An inline file as posted by the browser.
#[derive(Debug, Clone)]
struct FileDescriptor {
    file_name: String,
    file_type: String,
    file_size: u64,
    base64: String,
}

impl FileDescriptor {
    fn from_map(mut map: Map<String, Value>) -> Self {
        let mut take_string = |key: &str| match map.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let file_name = take_string("fileName").unwrap_or_else(|| "file".to_string());
        let file_type =
            take_string("fileType").unwrap_or_else(|| "application/octet-stream".to_string());
        let base64 = take_string("base64").unwrap_or_default();
        let file_size = map.get("fileSize").and_then(Value::as_u64).unwrap_or(0);
        Self {
            file_name,
            file_type,
            file_size,
            base64,
        }
    }

    fn metadata(&self) -> StoredFile {
        StoredFile {
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            file_type: self.file_type.clone(),
            file_path: None,
        }
    }
}

pub struct AttachmentUploader {
    blobs: Arc<dyn BlobStore>,
}

impl AttachmentUploader {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Upload every file descriptor in `data` and swap it for its stored reference.
    /// Returns how many files made it to storage.
    pub async fn resolve(&self, data: &mut Value) -> usize {
        let pointers = find_file_descriptors(data);
        if pointers.is_empty() {
            return 0;
        }

        let mut descriptors = Vec::with_capacity(pointers.len());
        for pointer in &pointers {
            if let Some(Value::Object(map)) = data.pointer_mut(pointer).map(Value::take) {
                descriptors.push((pointer.clone(), FileDescriptor::from_map(map)));
            }
        }

        let submission_tag = Uuid::new_v4().to_string();
        let stored = join_all(
            descriptors
                .into_iter()
                .map(|(pointer, descriptor)| {
                    let tag = submission_tag.as_str();
                    async move { (pointer, self.store_one(tag, descriptor).await) }
                }),
        )
        .await;

        let mut uploaded = 0;
        for (pointer, file) in stored {
            if file.file_path.is_some() {
                uploaded += 1;
            }
            if let (Some(slot), Ok(value)) = (data.pointer_mut(&pointer), serde_json::to_value(&file)) {
                *slot = value;
            }
        }
        uploaded
    }

    async fn store_one(&self, submission_tag: &str, descriptor: FileDescriptor) -> StoredFile {
        let metadata = descriptor.metadata();
        match self.try_store(submission_tag, descriptor).await {
            Ok(path) => {
                info!(path = %path, size = metadata.file_size, "attachment stored");
                StoredFile {
                    file_path: Some(path),
                    ..metadata
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    file_name = %metadata.file_name,
                    "attachment rejected, keeping metadata only"
                );
                metadata
            }
        }
    }

    async fn try_store(
        &self,
        submission_tag: &str,
        descriptor: FileDescriptor,
    ) -> Result<String, AttachmentError> {
        validate_file_size(descriptor.file_size)?;
        validate_file_type(&descriptor.file_type, &descriptor.file_name)?;

        let bytes = decode_payload(&descriptor.base64)?;
        let actual = bytes.len() as u64;
        if actual != descriptor.file_size {
            return Err(AttachmentError::SizeMismatch {
                declared: descriptor.file_size,
                actual,
            });
        }

        let path = storage_path(submission_tag, now_ms(), &descriptor.file_name);
        self.blobs
            .upload(&path, bytes, &descriptor.file_type)
            .await?;
        Ok(path)
    }
}

/// `form-submissions/{submission tag}/{epoch ms}-{sanitized name}`
pub fn storage_path(submission_tag: &str, timestamp_ms: u64, file_name: &str) -> String {
    format!(
        "{ATTACHMENT_PREFIX}{submission_tag}/{timestamp_ms}-{}",
        sanitize_file_name(file_name)
    )
}

/// Accepts bare base64 or a `data:<mime>;base64,` URL. Whitespace is ignored.
fn decode_payload(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let body = match payload.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, b)| b).unwrap_or(rest),
        None => payload,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact)
}

/// JSON pointers to every file descriptor in `value`, at any depth.
fn find_file_descriptors(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_descriptors(value, String::new(), &mut found);
    found
}

fn collect_descriptors(value: &Value, pointer: String, found: &mut Vec<String>) {
    match value {
        Value::Object(map) if is_file_descriptor(map) => found.push(pointer),
        Value::Object(map) => {
            for (key, child) in map {
                collect_descriptors(child, format!("{pointer}/{}", escape_pointer(key)), found);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_descriptors(child, format!("{pointer}/{i}"), found);
            }
        }
        _ => {}
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// A download path must name an object under [`ATTACHMENT_PREFIX`] and nothing else.
/// Only the shape [`storage_path`] produces is accepted: `[A-Za-z0-9._-]` segments joined
/// by single slashes, none of them starting with a dot.
pub fn validate_download_path(path: &str) -> Result<(), &'static str> {
    let Some(rest) = path.strip_prefix(ATTACHMENT_PREFIX) else {
        return Err("path must be inside the attachments folder");
    };
    if rest.is_empty() {
        return Err("path must name a file");
    }
    if path.contains("..") {
        return Err("path contains forbidden sequences");
    }
    for segment in rest.split('/') {
        if segment.is_empty() || segment.starts_with('.') {
            return Err("path contains forbidden sequences");
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err("path contains forbidden characters");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::MemoryBlobStore;

    fn descriptor(bytes: &[u8], declared: u64, name: &str, mime: &str) -> Value {
        json!({
            "_isFile": true,
            "base64": STANDARD.encode(bytes),
            "fileName": name,
            "fileType": mime,
            "fileSize": declared
        })
    }

    #[tokio::test]
    async fn valid_file_is_uploaded_and_payload_dropped() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let uploader = AttachmentUploader::new(blobs.clone());
        let pdf = vec![7u8; 1024];
        let mut data = json!({
            "firstName": "A",
            "resume": descriptor(&pdf, 1024, "r.pdf", "application/pdf")
        });

        assert_eq!(uploader.resolve(&mut data).await, 1);

        let resume = data["resume"].as_object().unwrap();
        assert!(resume.get("base64").is_none());
        assert!(resume.get("_isFile").is_none());
        let path = resume["filePath"].as_str().unwrap();
        assert!(path.starts_with(ATTACHMENT_PREFIX));
        assert!(path.ends_with("-r.pdf"));
        assert_eq!(resume["fileSize"], 1024);
        assert_eq!(blobs.object(path).map(|(b, _)| b), Some(pdf));
        assert_eq!(data["firstName"], "A");
    }

    #[tokio::test]
    async fn size_mismatch_keeps_metadata_without_path() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let uploader = AttachmentUploader::new(blobs.clone());
        let mut data = json!({
            "resume": descriptor(&[1, 2, 3], 1024, "r.pdf", "application/pdf"),
            "photo": descriptor(&[9; 16], 16, "me.png", "image/png")
        });

        assert_eq!(uploader.resolve(&mut data).await, 1);

        assert_eq!(
            data["resume"],
            json!({"fileName": "r.pdf", "fileSize": 1024, "fileType": "application/pdf"})
        );
        assert!(data["photo"]["filePath"].is_string());
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn disallowed_type_and_failed_upload_degrade_to_metadata() {
        let uploader = AttachmentUploader::new(Arc::new(MemoryBlobStore::failing()));
        let mut data = json!({
            "docs": [
                descriptor(&[1; 8], 8, "run.exe", "application/pdf"),
                descriptor(&[1; 8], 8, "ok.pdf", "application/pdf")
            ]
        });

        assert_eq!(uploader.resolve(&mut data).await, 0);
        for doc in data["docs"].as_array().unwrap() {
            assert!(doc.get("filePath").is_none());
            assert!(doc.get("base64").is_none());
        }
        assert_eq!(data["docs"][0]["fileName"], "run.exe");
    }

    #[tokio::test]
    async fn nested_descriptors_and_data_urls_are_found() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let uploader = AttachmentUploader::new(blobs.clone());
        let mut data = json!({
            "a/b": {
                "scan": {
                    "_isFile": true,
                    "base64": format!("data:image/png;base64,{}", STANDARD.encode([5u8; 4])),
                    "fileName": "../../scan.png",
                    "fileType": "image/png",
                    "fileSize": 4
                }
            }
        });

        assert_eq!(uploader.resolve(&mut data).await, 1);
        let path = data["a/b"]["scan"]["filePath"].as_str().unwrap();
        assert!(!path[ATTACHMENT_PREFIX.len()..].contains(".."));
        assert!(path.ends_with("_._scan.png"));
    }

    #[test]
    fn storage_path_is_namespaced_and_sanitized() {
        assert_eq!(
            storage_path("tag", 1700000000000, "my cv.pdf"),
            "form-submissions/tag/1700000000000-my_cv.pdf"
        );
    }

    #[test]
    fn download_paths_are_confined_to_the_prefix() {
        assert!(validate_download_path("form-submissions/abc/1-r.pdf").is_ok());
        assert!(validate_download_path("form-submissions/").is_err());
        assert!(validate_download_path("other/abc.pdf").is_err());
        assert!(validate_download_path("/form-submissions/abc.pdf").is_err());
        assert!(validate_download_path("form-submissions/../secrets.txt").is_err());
        assert!(validate_download_path("form-submissions//abc.pdf").is_err());
        assert!(validate_download_path("form-submissions\\..\\x").is_err());
        assert!(validate_download_path("form-submissions/a\nb.pdf").is_err());
        assert!(validate_download_path("form-submissions/%2e%2e/%2e%2e/other-bucket/secret.pdf").is_err());
        assert!(validate_download_path("form-submissions/.%2e/secret.pdf").is_err());
        assert!(validate_download_path("form-submissions/./abc.pdf").is_err());
        assert!(validate_download_path("form-submissions/abc/").is_err());
        assert!(validate_download_path("form-submissions/a.pdf?download=x").is_err());
        assert!(validate_download_path("form-submissions/a.pdf#frag").is_err());
    }

    #[test]
    fn generated_storage_paths_are_downloadable() {
        let tag = Uuid::new_v4().to_string();
        for name in ["CV (final).pdf", "..hidden.png", "résumé.docx", "a/b\\c.pdf", ""] {
            let path = storage_path(&tag, 1_700_000_000_000, name);
            assert_eq!(validate_download_path(&path), Ok(()), "{path}");
        }
    }
}
