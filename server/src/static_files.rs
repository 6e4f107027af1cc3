//! Static file serving for the web terminal shell. Paths are validated
//! before they ever touch the filesystem: no `..`, no `//`, no dot-prefixed
//! segments, no directories. An in-memory cache keyed by path serves repeat
//! hits and invalidates when the file's mtime moves.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dashmap::DashMap;

/// Vendor assets are content-addressed by release, so browsers may cache them
/// forever; app assets must revalidate every load.
const CACHE_IMMUTABLE: &str = "public, max-age=31536000, immutable";
const CACHE_REVALIDATE: &str = "must-revalidate, max-age=0";

struct CachedFile {
    mtime: SystemTime,
    body: Bytes,
    content_type: String,
}

#[derive(Default)]
pub struct StaticCache {
    files: DashMap<PathBuf, CachedFile>,
}

/// Validate and resolve a request path against a root directory. Returns
/// None for anything that could escape or probe the tree.
pub fn safe_join(root: &Path, request_path: &str) -> Option<PathBuf> {
    if request_path.contains("//") || request_path.contains('\\') {
        return None;
    }
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let rel = Path::new(trimmed);
    for component in rel.components() {
        match component {
            Component::Normal(seg) => {
                let seg = seg.to_str()?;
                if seg.starts_with('.') {
                    return None;
                }
            }
            // `.`/`..`, root, and prefix components are all rejected.
            _ => return None,
        }
    }
    Some(root.join(rel))
}

/// Content type by extension; texty types carry an explicit charset.
pub fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let essence = mime.essence_str();
    let texty = essence.starts_with("text/")
        || matches!(essence, "application/javascript" | "application/json" | "image/svg+xml");
    if texty {
        format!("{essence}; charset=utf-8")
    } else {
        essence.to_string()
    }
}

fn cache_control_for(request_path: &str) -> &'static str {
    if request_path.trim_start_matches('/').starts_with("vendor/") {
        CACHE_IMMUTABLE
    } else {
        CACHE_REVALIDATE
    }
}

impl StaticCache {
    /// Serve `request_path` from under `root`. 404 for anything unsafe,
    /// missing, or not a regular file.
    pub async fn serve(&self, root: &Path, request_path: &str) -> Response {
        let Some(full) = safe_join(root, request_path) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let meta = match tokio::fs::metadata(&full).await {
            Ok(m) if m.is_file() => m,
            _ => return StatusCode::NOT_FOUND.into_response(),
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        if let Some(cached) = self.files.get(&full) {
            if cached.mtime == mtime {
                return file_response(&cached.body, &cached.content_type, cache_control_for(request_path));
            }
        }

        let body = match tokio::fs::read(&full).await {
            Ok(data) => Bytes::from(data),
            Err(_) => return StatusCode::NOT_FOUND.into_response(),
        };
        let content_type = content_type_for(&full);
        let response = file_response(&body, &content_type, cache_control_for(request_path));
        self.files.insert(full, CachedFile { mtime, body, content_type });
        response
    }
}

fn file_response(body: &Bytes, content_type: &str, cache_control: &'static str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, cache_control.to_string()),
        ],
        Body::from(body.clone()),
    )
        .into_response()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_traversal_and_dot_segments() {
        let root = Path::new("/srv/public");
        assert!(safe_join(root, "/../etc/passwd").is_none());
        assert!(safe_join(root, "/a/../../etc/passwd").is_none());
        assert!(safe_join(root, "//double").is_none());
        assert!(safe_join(root, "/a//b").is_none());
        assert!(safe_join(root, "/.hidden").is_none());
        assert!(safe_join(root, "/a/.git/config").is_none());
        assert!(safe_join(root, "/").is_none());
        assert!(safe_join(root, "/a\\b").is_none());
    }

    #[test]
    fn accepts_plain_paths() {
        let root = Path::new("/srv/public");
        assert_eq!(safe_join(root, "/index.html"), Some(root.join("index.html")));
        assert_eq!(
            safe_join(root, "/vendor/xterm/xterm.js"),
            Some(root.join("vendor/xterm/xterm.js"))
        );
    }

    #[test]
    fn texty_types_carry_charset() {
        assert_eq!(content_type_for(Path::new("a.html")), "text/html; charset=utf-8");
        assert!(content_type_for(Path::new("a.js")).ends_with("javascript; charset=utf-8"));
        assert_eq!(content_type_for(Path::new("a.json")), "application/json; charset=utf-8");
        assert_eq!(content_type_for(Path::new("a.png")), "image/png");
        assert_eq!(content_type_for(Path::new("a.bin")), "application/octet-stream");
    }

    #[test]
    fn vendor_assets_are_immutable() {
        assert_eq!(cache_control_for("/vendor/xterm/xterm.js"), CACHE_IMMUTABLE);
        assert_eq!(cache_control_for("/app.js"), CACHE_REVALIDATE);
    }

    #[tokio::test]
    async fn serves_from_cache_until_mtime_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), b"console.log(1)").unwrap();
        let cache = StaticCache::default();

        let res = cache.serve(dir.path(), "/app.js").await;
        assert_eq!(res.status(), StatusCode::OK);
        let ct = res.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap();
        assert!(ct.ends_with("javascript; charset=utf-8"), "got {ct}");
        assert_eq!(res.headers().get(header::CACHE_CONTROL).unwrap(), CACHE_REVALIDATE);

        // Same mtime: cached body; force a different mtime and content.
        std::fs::write(dir.path().join("app.js"), b"console.log(2)").unwrap();
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(10);
        let file = std::fs::File::options()
            .write(true)
            .open(dir.path().join("app.js"))
            .unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let res = cache.serve(dir.path(), "/app.js").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"console.log(2)");
    }

    #[tokio::test]
    async fn directory_requests_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let cache = StaticCache::default();
        let res = cache.serve(dir.path(), "/sub").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
