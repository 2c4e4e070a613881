use serde_json::json;
use std::fs;
use std::path::Path;

use crate::audit::{current_unix_secs, log_message};
use crate::config::config;
use crate::db::with_db;
use crate::http::{RequestContext, respond_error, respond_internal_error, respond_json};
use crate::import::{DEFAULT_FEATURED_RATIO, import_rows, parse_csv};
use crate::session::require_admin;

pub(crate) const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MultipartError {
    NotMultipart,
    MissingBoundary,
    Malformed,
}

impl MultipartError {
    pub(crate) fn code(self) -> &'static str {
        match self {
            MultipartError::NotMultipart => "not-multipart",
            MultipartError::MissingBoundary => "missing-boundary",
            MultipartError::Malformed => "malformed-multipart",
        }
    }
}

pub(crate) fn multipart_boundary(content_type: &str) -> Result<String, MultipartError> {
    let mut params = content_type.split(';');
    let mime = params.next().unwrap_or_default().trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return Err(MultipartError::NotMultipart);
    }
    params
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or(MultipartError::MissingBoundary)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn disposition_param(header: &str, key: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

pub(crate) fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<MultipartPart>, MultipartError> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut cursor = find(body, &delimiter, 0).ok_or(MultipartError::Malformed)? + delimiter.len();
    let mut parts = Vec::new();

    loop {
        if body[cursor..].starts_with(b"--") {
            return Ok(parts);
        }
        if body[cursor..].starts_with(b"\r\n") {
            cursor += 2;
        }
        let header_end = find(body, b"\r\n\r\n", cursor).ok_or(MultipartError::Malformed)?;
        let headers = String::from_utf8_lossy(&body[cursor..header_end]).to_string();
        let data_start = header_end + 4;

        let mut closing = b"\r\n".to_vec();
        closing.extend_from_slice(&delimiter);
        let data_end = find(body, &closing, data_start).ok_or(MultipartError::Malformed)?;

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                name = disposition_param(value, "name");
                filename = disposition_param(value, "filename");
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }

        if let Some(name) = name {
            parts.push(MultipartPart {
                name,
                filename,
                content_type,
                data: body[data_start..data_end].to_vec(),
            });
        }
        cursor = data_end + closing.len();
        if cursor > body.len() {
            return Err(MultipartError::Malformed);
        }
    }
}

/// Lower-cased extension if it is on the allow-list.
pub(crate) fn allowed_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

pub(crate) fn store_image(dir: &Path, ext: &str, data: &[u8]) -> Result<String, String> {
    fs::create_dir_all(dir).map_err(|e| format!("upload-dir-create-failed: {e}"))?;
    let name = format!("{}.{ext}", nanoid::nanoid!());
    fs::write(dir.join(&name), data).map_err(|e| format!("upload-write-failed: {e}"))?;
    Ok(name)
}

fn read_parts(ctx: &RequestContext, action: &str) -> Result<Option<Vec<MultipartPart>>, String> {
    let content_type = ctx.header("content-type").unwrap_or_default();
    let parsed = multipart_boundary(content_type).and_then(|b| parse_multipart(&ctx.body, &b));
    match parsed {
        Ok(parts) => Ok(Some(parts)),
        Err(err) => {
            respond_json(
                ctx,
                400,
                &json!({
                    "error": "Invalid upload",
                    "message": "Expected a multipart/form-data body",
                }),
                action,
                Some(json!({ "reason": err.code() })),
            )?;
            Ok(None)
        }
    }
}

pub(crate) fn handle_upload_api(ctx: &RequestContext) -> Result<(), String> {
    let route = ctx.path.trim_end_matches('/');
    match (ctx.method.as_str(), route) {
        ("POST", "/api/upload") => handle_image_upload(ctx),
        ("POST", "/api/upload/cars-csv") => handle_csv_upload(ctx),
        (_, "/api/upload" | "/api/upload/cars-csv") => {
            respond_error(ctx, 405, "Method not allowed", "upload-api")
        }
        _ => respond_error(ctx, 404, "Not found", "upload-api"),
    }
}

fn handle_image_upload(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "upload-image";
    if require_admin(ctx, ACTION)?.is_none() {
        return Ok(());
    }
    let Some(parts) = read_parts(ctx, ACTION)? else {
        return Ok(());
    };
    let Some(part) = parts
        .into_iter()
        .find(|p| p.name == "image" && p.filename.as_deref().is_some_and(|f| !f.is_empty()))
    else {
        return respond_json(
            ctx,
            400,
            &json!({ "error": "Missing file", "message": "Please provide an image file" }),
            ACTION,
            None,
        );
    };

    let filename = part.filename.clone().unwrap_or_default();
    let Some(ext) = allowed_extension(&filename) else {
        return respond_json(
            ctx,
            400,
            &json!({
                "error": "Invalid file type",
                "message": "Only image files (jpg, jpeg, png, gif) are allowed",
            }),
            ACTION,
            Some(json!({ "filename": filename })),
        );
    };
    if part.data.len() > MAX_IMAGE_BYTES {
        return respond_json(
            ctx,
            413,
            &json!({ "error": "File too large", "message": "Images are limited to 5 MB" }),
            ACTION,
            Some(json!({ "size": part.data.len() })),
        );
    }

    match store_image(&config().upload_dir, &ext, &part.data) {
        Ok(name) => {
            log_message(&format!("info image-uploaded name={name} size={}", part.data.len()));
            respond_json(
                ctx,
                200,
                &json!({ "url": format!("/uploads/{name}") }),
                ACTION,
                Some(json!({
                    "stored": name,
                    "original": filename,
                    "size": part.data.len(),
                    "content_type": part.content_type,
                })),
            )
        }
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn handle_csv_upload(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "upload-cars-csv";
    if require_admin(ctx, ACTION)?.is_none() {
        return Ok(());
    }
    let Some(parts) = read_parts(ctx, ACTION)? else {
        return Ok(());
    };
    let Some(part) = parts.into_iter().find(|p| p.name == "file") else {
        return respond_json(
            ctx,
            400,
            &json!({ "error": "Missing file", "message": "Please provide a CSV file" }),
            ACTION,
            None,
        );
    };

    let now = current_unix_secs() as i64;
    let parsed = match parse_csv(part.data.as_slice(), DEFAULT_FEATURED_RATIO, now, &mut rand::thread_rng()) {
        Ok(parsed) => parsed,
        Err(err) => {
            return respond_json(
                ctx,
                400,
                &json!({ "error": "Invalid CSV", "message": err }),
                ACTION,
                None,
            );
        }
    };

    match with_db(move |pool| async move { import_rows(&pool, parsed, false, now).await }) {
        Ok(report) => {
            let payload = serde_json::to_value(&report).map_err(|e| e.to_string())?;
            respond_json(
                ctx,
                200,
                &payload,
                ACTION,
                Some(json!({ "imported": report.imported, "skipped": report.skipped })),
            )
        }
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(boundary: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, data) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match filename {
                Some(f) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=----abc123").unwrap(),
            "----abc123"
        );
        assert_eq!(
            multipart_boundary("Multipart/Form-Data; charset=utf-8; boundary=\"q z\"").unwrap(),
            "q z"
        );
        assert_eq!(
            multipart_boundary("application/json"),
            Err(MultipartError::NotMultipart)
        );
        assert_eq!(
            multipart_boundary("multipart/form-data"),
            Err(MultipartError::MissingBoundary)
        );
    }

    #[test]
    fn parses_fields_and_binary_files() {
        let binary: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x00, 0xff];
        let body = form(
            "XyZ",
            &[("caption", None, b"hello"), ("image", Some("Car.PNG"), binary)],
        );
        let parts = parse_multipart(&body, "XyZ").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "caption");
        assert_eq!(parts[0].data, b"hello");
        assert_eq!(parts[1].filename.as_deref(), Some("Car.PNG"));
        assert_eq!(parts[1].content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(parts[1].data, binary);
    }

    #[test]
    fn truncated_bodies_are_malformed() {
        let body = b"--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nno end";
        assert_eq!(parse_multipart(body, "XyZ"), Err(MultipartError::Malformed));
        assert_eq!(parse_multipart(b"garbage", "XyZ"), Err(MultipartError::Malformed));
    }

    #[test]
    fn extension_allow_list() {
        assert_eq!(allowed_extension("photo.JPG").as_deref(), Some("jpg"));
        assert_eq!(allowed_extension("a.jpeg").as_deref(), Some("jpeg"));
        assert_eq!(allowed_extension("a.gif").as_deref(), Some("gif"));
        assert_eq!(allowed_extension("a.png.exe"), None);
        assert_eq!(allowed_extension("noext"), None);
        assert_eq!(allowed_extension("a.svg"), None);
    }

    #[test]
    fn stored_images_get_random_names() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("uploads");
        let name = store_image(&target, "png", b"data").unwrap();
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), 21 + ".png".len());
        assert_eq!(fs::read(target.join(&name)).unwrap(), b"data");
        assert_ne!(store_image(&target, "png", b"data").unwrap(), name);
    }
}
