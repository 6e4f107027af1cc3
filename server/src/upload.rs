//! Image uploads: type is decided by magic bytes, never by the client's
//! filename, and the file lands under a fresh UUID so nothing the client
//! sends influences the path. The response's relative URL is the contract;
//! the filesystem path is advisory and only shown to localhost callers.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::error::ApiError;

/// Body limit for POST /upload.
pub const UPLOAD_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// Detect a supported image type from its leading bytes. Returns the file
/// extension used for the stored name.
pub fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("png");
    }
    if bytes.starts_with(b"\xff\xd8\xff") {
        return Some("jpg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("gif");
    }
    if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return Some("webp");
    }
    None
}

/// Store an upload and return its relative URL path (`/uploads/<uuid>.<ext>`)
/// plus the absolute filesystem path for local callers.
pub async fn store_upload(uploads_dir: &Path, body: &[u8]) -> Result<(String, String), ApiError> {
    let Some(ext) = sniff_image(body) else {
        return Err(ApiError::BadRequest(
            "unsupported file type; expected png, jpeg, gif, or webp".into(),
        ));
    };
    let file_name = format!("{}.{ext}", uuid::Uuid::new_v4());
    let full = uploads_dir.join(&file_name);
    tokio::fs::create_dir_all(uploads_dir)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("creating uploads dir: {e}")))?;
    // Uploads live next to the auth store's entity files; same 0600 policy.
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&full)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("creating upload file: {e}")))?;
    file.write_all(body)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("writing upload: {e}")))?;
    Ok((format!("/uploads/{file_name}"), full.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sniffs_by_magic_bytes_not_names() {
        assert_eq!(sniff_image(b"\x89PNG\r\n\x1a\n____"), Some("png"));
        assert_eq!(sniff_image(b"\xff\xd8\xff\xe0rest"), Some("jpg"));
        assert_eq!(sniff_image(b"GIF89a..."), Some("gif"));
        assert_eq!(sniff_image(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_image(b"<svg xmlns="), None);
        assert_eq!(sniff_image(b"#!/bin/sh"), None);
        assert_eq!(sniff_image(b""), None);
    }

    #[tokio::test]
    async fn stored_path_matches_the_contract() {
        let dir = tempfile::tempdir().unwrap();
        let (path, absolute) = store_upload(dir.path(), b"\x89PNG\r\n\x1a\nimage-data")
            .await
            .unwrap();
        // ^/uploads/[0-9a-f-]{36}\.(png|jpg|gif|webp)$
        let rest = path.strip_prefix("/uploads/").expect("relative url prefix");
        let (stem, ext) = rest.rsplit_once('.').unwrap();
        assert_eq!(stem.len(), 36);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
        assert!(matches!(ext, "png" | "jpg" | "gif" | "webp"));
        assert!(std::path::Path::new(&absolute).is_file());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&absolute).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn unsupported_types_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = store_upload(dir.path(), b"plain text").await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
