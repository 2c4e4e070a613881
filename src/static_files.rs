use serde_json::json;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::audit::log_message;
use crate::config::config;
use crate::http::{RequestContext, respond_binary, respond_error, respond_head};

const UPLOADS_PREFIX: &str = "/uploads/";

/// Serves uploads, built frontend assets and the SPA shell. Returns `false`
/// when the request is not a static-file request at all.
pub(crate) fn try_serve_static(ctx: &RequestContext) -> Result<bool, String> {
    if ctx.method != "GET" && ctx.method != "HEAD" {
        return Ok(false);
    }
    if ctx.path == "/api" || ctx.path.starts_with("/api/") {
        return Ok(false);
    }
    let cfg = config();

    if let Some(rest) = ctx.path.strip_prefix(UPLOADS_PREFIX) {
        let Some(relative) = sanitize_path(rest) else {
            respond_error(ctx, 404, "Not found", "static-upload")?;
            return Ok(true);
        };
        let asset = cfg.upload_dir.join(&relative);
        if asset.is_file() {
            serve_file(ctx, &asset, &relative, "static-upload")?;
        } else {
            respond_error(ctx, 404, "Not found", "static-upload")?;
        }
        return Ok(true);
    }

    let Some(relative) = sanitize_path(&ctx.path) else {
        log_message(&format!("404 static-path-rejected path={}", ctx.path));
        respond_error(ctx, 404, "Not found", "static-file")?;
        return Ok(true);
    };
    let asset = cfg.public_dir.join(&relative);
    if asset.is_file() {
        serve_file(ctx, &asset, &relative, "static-file")?;
        return Ok(true);
    }

    // Client-side routes fall back to the shell; missing assets stay 404.
    if looks_like_asset(&relative) {
        respond_error(ctx, 404, "Not found", "static-file")?;
        return Ok(true);
    }
    let index = cfg.public_dir.join("index.html");
    if index.is_file() {
        serve_file(ctx, &index, Path::new("index.html"), "spa-fallback")?;
    } else {
        log_message("404 frontend missing index.html");
        respond_error(ctx, 404, "Not found", "spa-fallback")?;
    }
    Ok(true)
}

fn serve_file(ctx: &RequestContext, asset: &Path, relative: &Path, action: &str) -> Result<(), String> {
    let content_type = content_type_for(relative);
    let meta = Some(json!({ "asset": relative.to_string_lossy() }));
    if ctx.method == "HEAD" {
        let len = fs::metadata(asset)
            .map(|m| m.len())
            .unwrap_or(0)
            .min(usize::MAX as u64);
        return respond_head(ctx, 200, content_type, len as usize, action, meta);
    }
    let body = fs::read(asset).map_err(|e| format!("failed to read asset {}: {e}", asset.display()))?;
    respond_binary(ctx, 200, content_type, &body, action, meta)
}

fn looks_like_asset(relative: &Path) -> bool {
    relative.extension().is_some() || relative.starts_with("assets")
}

pub(crate) fn sanitize_path(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Some(PathBuf::from("index.html"));
    }

    let mut sanitized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => sanitized.push(part),
            Component::CurDir => continue,
            _ => return None,
        }
    }

    if sanitized.as_os_str().is_empty() {
        sanitized.push("index.html");
    }
    Some(sanitized)
}

pub(crate) fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        Some("webmanifest") => "application/manifest+json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_rejects_traversal() {
        assert_eq!(sanitize_path("/"), Some(PathBuf::from("index.html")));
        assert_eq!(
            sanitize_path("/assets/./app.js"),
            Some(PathBuf::from("assets/app.js"))
        );
        assert_eq!(sanitize_path("/../etc/passwd"), None);
        assert_eq!(sanitize_path("/assets/../../secret"), None);
    }

    #[test]
    fn asset_detection_drives_spa_fallback() {
        assert!(looks_like_asset(Path::new("logo.png")));
        assert!(looks_like_asset(Path::new("assets/chunk")));
        assert!(!looks_like_asset(Path::new("inventory/42")));
        assert!(!looks_like_asset(Path::new("admin")));
    }

    #[test]
    fn content_types_cover_uploaded_images() {
        assert_eq!(content_type_for(Path::new("a.GIF")), "image/gif");
        assert_eq!(content_type_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("index.html")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }
}
