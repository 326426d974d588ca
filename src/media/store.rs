//! Media storage
//!
//! Downloaded media is written under the uploads directory with a generated
//! name and served back at `/api/uploads/<file>`. Original filenames are
//! sanitized so a hostile sender can never influence the path.

use std::path::PathBuf;

use async_trait::async_trait;
use rand::RngCore;

use crate::{Error, Result};

/// Max length kept from a sanitized original basename
const MAX_BASE_LEN: usize = 48;

/// Blob store seam
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Persist bytes, returning the public URL path
    async fn save(
        &self,
        bytes: &[u8],
        original_name: Option<&str>,
        mime: Option<&str>,
    ) -> Result<String>;
}

/// Filesystem-backed media store
pub struct FsMediaStore {
    uploads_dir: PathBuf,
}

impl FsMediaStore {
    /// Create a store rooted at the given uploads directory
    #[must_use]
    pub fn new(uploads_dir: PathBuf) -> Self {
        Self { uploads_dir }
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn save(
        &self,
        bytes: &[u8],
        original_name: Option<&str>,
        mime: Option<&str>,
    ) -> Result<String> {
        let name = storage_name(original_name, mime);
        let path = self.uploads_dir.join(&name);

        tokio::fs::create_dir_all(&self.uploads_dir)
            .await
            .map_err(|e| Error::Media(format!("uploads dir: {e}")))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::Media(format!("write {}: {e}", path.display())))?;

        tracing::debug!(file = %name, size = bytes.len(), "stored media file");
        Ok(format!("/api/uploads/{name}"))
    }
}

/// Build a unique storage filename: `<millis>-<12 hex>-<sanitized base><ext>`
#[must_use]
pub fn storage_name(original_name: Option<&str>, mime: Option<&str>) -> String {
    let base = original_name.map_or_else(|| "file".to_string(), sanitize_base);

    // Prefer the extension carried by the original name; fall back to mime
    let ext = original_name
        .and_then(extension_of)
        .or_else(|| mime.and_then(ext_for_mime).map(str::to_string))
        .map_or_else(String::new, |e| format!(".{e}"));

    let millis = chrono::Utc::now().timestamp_millis();
    let mut suffix = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut suffix);

    format!("{millis}-{}-{base}{ext}", hex::encode(suffix))
}

/// Strip any path components and non-portable characters from a filename
#[must_use]
pub fn sanitize_base(name: &str) -> String {
    // Basename only; a name like "../../etc/passwd" reduces to "passwd"
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);

    let stem = base.rsplit_once('.').map_or(base, |(stem, _)| stem);

    let mut cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.truncate(MAX_BASE_LEN);

    if cleaned.trim_matches('_').is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

fn extension_of(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?;
    let (_, ext) = base.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Map a MIME type to a file extension
#[must_use]
pub fn ext_for_mime(mime: &str) -> Option<&'static str> {
    let bare = mime.split(';').next().unwrap_or(mime).trim();
    match bare {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "video/mp4" => Some("mp4"),
        "video/3gpp" => Some("3gp"),
        "audio/ogg" => Some("ogg"),
        "audio/mpeg" => Some("mp3"),
        "audio/mp4" | "audio/aac" => Some("m4a"),
        "audio/amr" => Some("amr"),
        "application/pdf" => Some("pdf"),
        "application/msword" => Some("doc"),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some("docx"),
        "application/vnd.ms-excel" => Some("xls"),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Some("xlsx"),
        "text/plain" => Some("txt"),
        _ => None,
    }
}
