use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::time::{Instant, SystemTime};
use url::Url;

use crate::audit::{log_message, persist_event_record, redact_token, system_time_secs};
use crate::config::config;

pub(crate) const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub(crate) struct RequestContext {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub raw_request: String,
    pub request_id: String,
    pub remote_addr: Option<String>,
    pub started_at: Instant,
    pub received_at: SystemTime,
    response_headers: RefCell<Vec<(String, String)>>,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: String,
        path: String,
        query: Option<String>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
        raw_request: String,
        request_id: String,
        remote_addr: Option<String>,
        started_at: Instant,
        received_at: SystemTime,
    ) -> Self {
        Self {
            method,
            path,
            query,
            headers,
            body,
            raw_request,
            request_id,
            remote_addr,
            started_at,
            received_at,
            response_headers: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub(crate) fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_ref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.trim().to_string())
            .last()
            .filter(|v| !v.is_empty())
    }

    pub(crate) fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.header("cookie")?;
        raw.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name)
                .then(|| value.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    }

    pub(crate) fn bearer_token(&self) -> Option<String> {
        let raw = self.header("authorization")?;
        let (scheme, token) = raw.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        (!token.is_empty()).then(|| token.to_string())
    }

    pub(crate) fn user_agent(&self) -> String {
        self.header("user-agent").unwrap_or("Unknown").to_string()
    }

    /// Client address used for rate limiting and login alerts.
    pub(crate) fn client_ip(&self) -> String {
        if config().trust_proxy {
            if let Some(forwarded) = self.header("x-forwarded-for") {
                if let Some(last) = forwarded
                    .split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .last()
                {
                    return last.to_string();
                }
            }
        }

        self.remote_addr
            .as_deref()
            .map(strip_port)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub(crate) fn add_response_header(&self, name: &str, value: &str) {
        self.response_headers
            .borrow_mut()
            .push((name.to_string(), value.to_string()));
    }

    pub(crate) fn take_response_headers(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.response_headers.borrow_mut())
    }
}

fn strip_port(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest).to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host.to_string()
        }
        _ => addr.to_string(),
    }
}

pub(crate) fn parse_request_line(request_line: &str) -> (String, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_ascii_uppercase();
    let target = parts.next().unwrap_or("").to_string();
    (method, target)
}

pub(crate) fn parse_target(raw_target: &str) -> Result<(String, Option<String>), String> {
    if raw_target.is_empty() {
        return Err("empty target".into());
    }

    let url = if raw_target.starts_with("http://") || raw_target.starts_with("https://") {
        Url::parse(raw_target).map_err(|e| e.to_string())?
    } else {
        Url::parse(&format!("http://dummy{raw_target}")).map_err(|e| e.to_string())?
    };

    let path = url.path().to_string();
    let query = url.query().map(|s| s.to_string());
    Ok((path, query))
}

pub(crate) fn read_headers<R: BufRead>(reader: &mut R) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| format!("failed to read header: {e}"))?;
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        if read == 0 || trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

pub(crate) fn read_chunked_body<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, String> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        let read = reader
            .read_line(&mut size_line)
            .map_err(|e| format!("failed to read chunk size: {e}"))?;
        if read == 0 {
            return Err("unexpected end of chunked body".into());
        }
        let size_str = size_line.trim().split(';').next().unwrap_or("").trim();
        if size_str.is_empty() {
            continue;
        }

        let size = usize::from_str_radix(size_str, 16)
            .map_err(|e| format!("invalid chunk size '{size_str}': {e}"))?;

        if size == 0 {
            loop {
                let mut trailer = String::new();
                let read = reader
                    .read_line(&mut trailer)
                    .map_err(|e| format!("failed to read chunk trailer: {e}"))?;
                if read == 0 || trailer.trim().is_empty() {
                    break;
                }
            }
            break;
        }

        if body.len() + size > MAX_BODY_BYTES {
            return Err("body-too-large".into());
        }

        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .map_err(|e| format!("failed to read chunk body: {e}"))?;
        body.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .map_err(|e| format!("failed to read chunk terminator: {e}"))?;
    }

    Ok(body)
}

pub(crate) fn parse_json_body<T: DeserializeOwned>(ctx: &RequestContext) -> Result<T, String> {
    if ctx.body.is_empty() {
        return serde_json::from_str("{}").map_err(|e| format!("invalid-json:{e}"));
    }
    serde_json::from_slice(&ctx.body).map_err(|e| format!("invalid-json:{e}"))
}

/// Splits `/api/cars/12/order` into `["api", "cars", "12", "order"]`.
pub(crate) fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn write_payload_response(
    status: u16,
    content_type: Option<&str>,
    content_length: usize,
    headers: &[(String, String)],
    body: Option<&[u8]>,
) -> io::Result<()> {
    let cfg = config();
    let mut stdout = io::stdout().lock();
    write!(stdout, "HTTP/1.1 {} {}\r\n", status, reason_phrase(status))?;
    if let Some(content_type) = content_type {
        write!(stdout, "Content-Type: {}\r\n", content_type)?;
    }
    write!(stdout, "Content-Length: {}\r\n", content_length)?;
    write!(stdout, "Access-Control-Allow-Origin: {}\r\n", cfg.cors_origin)?;
    if cfg.cors_origin != "*" {
        stdout.write_all(b"Vary: Origin\r\n")?;
    }
    for (name, value) in headers {
        write!(stdout, "{}: {}\r\n", name, value)?;
    }
    stdout.write_all(b"Connection: close\r\n")?;
    stdout.write_all(b"\r\n")?;
    if let Some(bytes) = body {
        stdout.write_all(bytes)?;
    }
    stdout.flush()
}

fn send_payload(
    status: u16,
    content_type: Option<&str>,
    content_length: usize,
    headers: &[(String, String)],
    body: Option<&[u8]>,
) -> Result<(), String> {
    match write_payload_response(status, content_type, content_length, headers, body) {
        Ok(()) => Ok(()),
        Err(err)
            if err.kind() == io::ErrorKind::BrokenPipe
                || err.kind() == io::ErrorKind::ConnectionReset =>
        {
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}

/// Used before a [`RequestContext`] exists (malformed request line etc).
pub(crate) fn send_basic_error(status: u16, message: &str) -> Result<(), String> {
    let body = json!({ "error": message }).to_string();
    send_payload(
        status,
        Some("application/json; charset=utf-8"),
        body.len(),
        &[],
        Some(body.as_bytes()),
    )
}

pub(crate) fn respond_json(
    ctx: &RequestContext,
    status: u16,
    payload: &Value,
    action: &str,
    extra: Option<Value>,
) -> Result<(), String> {
    let body = serde_json::to_vec(payload).map_err(|e| e.to_string())?;
    let mut metadata = extra.unwrap_or_else(|| json!({}));
    metadata["response_size"] = Value::from(body.len() as u64);
    let headers = ctx.take_response_headers();
    let result = send_payload(
        status,
        Some("application/json; charset=utf-8"),
        body.len(),
        &headers,
        Some(&body),
    );
    log_audit_event(ctx, status, action, metadata);
    result
}

pub(crate) fn respond_error(
    ctx: &RequestContext,
    status: u16,
    message: &str,
    action: &str,
) -> Result<(), String> {
    respond_json(
        ctx,
        status,
        &json!({ "error": message }),
        action,
        Some(json!({ "error": message })),
    )
}

/// Logs the underlying failure and answers with a generic 500.
pub(crate) fn respond_internal_error(
    ctx: &RequestContext,
    action: &str,
    err: &str,
) -> Result<(), String> {
    log_message(&format!("500 {action} err={err}"));
    respond_json(
        ctx,
        500,
        &json!({ "error": "Internal server error" }),
        action,
        Some(json!({ "error": err })),
    )
}

pub(crate) fn respond_empty(ctx: &RequestContext, status: u16, action: &str) -> Result<(), String> {
    let headers = ctx.take_response_headers();
    let result = send_payload(status, None, 0, &headers, None);
    log_audit_event(ctx, status, action, json!({}));
    result
}

pub(crate) fn respond_redirect(
    ctx: &RequestContext,
    location: &str,
    action: &str,
    extra: Option<Value>,
) -> Result<(), String> {
    ctx.add_response_header("Location", location);
    ctx.add_response_header("Cache-Control", "no-store");
    let headers = ctx.take_response_headers();
    let result = send_payload(302, None, 0, &headers, None);
    log_audit_event(ctx, 302, action, extra.unwrap_or_else(|| json!({})));
    result
}

pub(crate) fn respond_binary(
    ctx: &RequestContext,
    status: u16,
    content_type: &str,
    body: &[u8],
    action: &str,
    extra: Option<Value>,
) -> Result<(), String> {
    let mut metadata = extra.unwrap_or_else(|| json!({}));
    metadata["response_size"] = Value::from(body.len() as u64);
    let headers = ctx.take_response_headers();
    let result = send_payload(status, Some(content_type), body.len(), &headers, Some(body));
    log_audit_event(ctx, status, action, metadata);
    result
}

pub(crate) fn respond_head(
    ctx: &RequestContext,
    status: u16,
    content_type: &str,
    content_length: usize,
    action: &str,
    extra: Option<Value>,
) -> Result<(), String> {
    let mut metadata = extra.unwrap_or_else(|| json!({}));
    metadata["response_size"] = Value::from(content_length as u64);
    let headers = ctx.take_response_headers();
    let result = send_payload(status, Some(content_type), content_length, &headers, None);
    log_audit_event(ctx, status, action, metadata);
    result
}

pub(crate) fn respond_preflight(ctx: &RequestContext) -> Result<(), String> {
    ctx.add_response_header(
        "Access-Control-Allow-Methods",
        "GET, POST, PUT, DELETE, OPTIONS",
    );
    ctx.add_response_header(
        "Access-Control-Allow-Headers",
        "Content-Type, Authorization",
    );
    ctx.add_response_header("Access-Control-Max-Age", "3600");
    respond_empty(ctx, 204, "cors-preflight")
}

fn log_audit_event(ctx: &RequestContext, status: u16, action: &str, mut meta: Value) {
    let elapsed_ms = ctx.started_at.elapsed().as_millis() as u64;
    meta["path"] = Value::from(ctx.path.clone());
    if let Some(q) = ctx.query.as_ref().map(|q| redact_token(q)) {
        meta["query"] = Value::from(q);
    }
    if let Some(addr) = &ctx.remote_addr {
        meta["remote"] = Value::from(addr.clone());
    }
    persist_event_record(
        &ctx.request_id,
        system_time_secs(ctx.received_at),
        &ctx.method,
        Some(&ctx.path),
        status,
        action,
        elapsed_ms,
        &meta,
    );
}

#[cfg(test)]
pub(crate) fn test_context(method: &str, target: &str, headers: &[(&str, &str)]) -> RequestContext {
    let (path, query) = parse_target(target).unwrap();
    RequestContext::new(
        method.to_string(),
        path,
        query,
        headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect(),
        Vec::new(),
        format!("{method} {target} HTTP/1.1"),
        "test".to_string(),
        Some("203.0.113.9:55012".to_string()),
        Instant::now(),
        SystemTime::now(),
    )
}
