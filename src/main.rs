mod audit;
mod auth;
mod carousel;
mod cars;
mod config;
mod db;
mod google;
mod http;
mod import;
mod mailer;
mod maintenance;
mod password;
mod rate_limit;
mod recovery;
mod session;
mod showroom;
mod static_files;
mod totp;
mod upload;
mod users;

use serde_json::json;
use std::env;
use std::fs::File;
use std::io::{self, BufRead, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use audit::{current_unix_secs, log_message, next_request_id, record_system_event, redact_token};
use config::{
    DEFAULT_HTTP_ADDR, ENV_DB_URL, ENV_HTTP_ADDR, ENV_JWT_SECRET, ENV_PROFILE, ENV_REMOTE_ADDR,
    Profile, config,
};
use db::{db_pool, db_status, with_db};
use http::{
    MAX_BODY_BYTES, RequestContext, parse_request_line, parse_target, read_chunked_body,
    read_headers, respond_error, respond_json, respond_preflight, send_basic_error,
};

fn main() {
    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| "dealership-api".into());
    let Some(raw_cmd) = args.next() else {
        print_usage(&exe);
        std::process::exit(1);
    };

    apply_env_profile_defaults();

    let command = normalize_command(&raw_cmd);
    let remaining: Vec<String> = args.collect();

    match command.as_str() {
        "server" => run_server(),
        "http-server" => run_http_server_cli(&remaining),
        "import-cars" => run_import_cli(&remaining),
        "dedupe-cars" => run_dedupe_cli(&remaining),
        "create-user" => run_create_user_cli(&remaining),
        "hash-password" => run_hash_password_cli(&remaining),
        "prune-tokens" => run_prune_cli(&remaining),
        "version" => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        "help" => {
            print_usage(&exe);
            std::process::exit(0);
        }
        _ => {
            eprintln!("unknown command: {raw_cmd}");
            print_usage(&exe);
            std::process::exit(2);
        }
    }
}

fn apply_env_profile_defaults() {
    let profile = Profile::from_env();

    if profile == Profile::Test
        && env::var(ENV_DB_URL)
            .ok()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        // SAFETY: called once at process start, before any thread is spawned.
        unsafe {
            env::set_var(ENV_DB_URL, "sqlite::memory:?cache=shared");
        }
    }

    let secret_missing = env::var(ENV_JWT_SECRET)
        .ok()
        .map(|v| v.trim().is_empty())
        .unwrap_or(true);
    if secret_missing {
        match profile {
            Profile::Dev => log_message(&format!(
                "warn jwt-secret-default {ENV_JWT_SECRET} unset; using the development key"
            )),
            Profile::Prod => log_message(&format!(
                "warn jwt-secret-missing {ENV_JWT_SECRET} unset; authentication is disabled"
            )),
            Profile::Test => {}
        }
    }
}

fn normalize_command(raw: &str) -> String {
    raw.trim_start_matches('-').to_lowercase()
}

fn run_server() -> ! {
    if let Err(err) = handle_connection() {
        log_message(&format!("500 internal-error {err}"));
        let _ = send_basic_error(500, "Internal server error");
        std::process::exit(1);
    }
    std::process::exit(0);
}

fn run_http_server_cli(_args: &[String]) -> ! {
    let addr = env::var(ENV_HTTP_ADDR).unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
    let listener = TcpListener::bind(&addr).unwrap_or_else(|err| {
        eprintln!("failed to bind HTTP address {addr}: {err}");
        std::process::exit(1);
    });

    eprintln!(
        "listening on http://{addr} (http-server, profile={})",
        config().profile.as_str()
    );

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = spawn_server_for_stream(stream, peer) {
                    eprintln!("failed to spawn server for {peer:?}: {err}");
                }
            }
            Err(err) => {
                eprintln!("accept failed: {err}");
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

/// One short-lived `server` child per connection, socket on stdin/stdout.
fn spawn_server_for_stream(stream: TcpStream, peer: SocketAddr) -> Result<(), String> {
    stream
        .set_nodelay(true)
        .map_err(|e| format!("set_nodelay failed: {e}"))?;

    let stdin_stream = stream
        .try_clone()
        .map_err(|e| format!("failed to clone stream for stdin: {e}"))?;
    let stdout_stream = stream;

    let stdin_fd = stdin_stream.into_raw_fd();
    let stdout_fd = stdout_stream.into_raw_fd();

    let exe = env::current_exe().map_err(|e| e.to_string())?;

    let mut cmd = Command::new(exe);
    cmd.arg("server");
    cmd.env(ENV_REMOTE_ADDR, peer.to_string());
    // SAFETY: both descriptors were just released by into_raw_fd and are
    // owned by the child's Stdio from here on.
    unsafe {
        cmd.stdin(Stdio::from(File::from_raw_fd(stdin_fd)));
        cmd.stdout(Stdio::from(File::from_raw_fd(stdout_fd)));
    }
    cmd.stderr(Stdio::inherit());

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn server child: {e}"))?;
    // Reap in the background so finished children do not linger as zombies.
    thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(())
}

fn run_import_cli(args: &[String]) -> ! {
    let mut path: Option<String> = None;
    let mut truncate = false;
    let mut ratio = import::DEFAULT_FEATURED_RATIO;

    let mut idx = 0;
    while idx < args.len() {
        match args[idx].as_str() {
            "--truncate" => truncate = true,
            "--featured-ratio" => {
                idx += 1;
                ratio = match args.get(idx).and_then(|v| v.trim().parse::<f64>().ok()) {
                    Some(v) if (0.0..=1.0).contains(&v) => v,
                    _ => {
                        eprintln!("--featured-ratio expects a number between 0 and 1");
                        std::process::exit(2);
                    }
                };
            }
            other if other.starts_with("--") => {
                eprintln!("unknown import option: {other}");
                std::process::exit(2);
            }
            other => path = Some(other.to_string()),
        }
        idx += 1;
    }

    let Some(path) = path else {
        eprintln!("import-cars requires a CSV path");
        std::process::exit(2);
    };

    let now = current_unix_secs() as i64;
    let result = File::open(&path)
        .map_err(|e| format!("failed to open {path}: {e}"))
        .and_then(|file| import::parse_csv(file, ratio, now, &mut rand::thread_rng()))
        .and_then(|parsed| {
            with_db(move |pool| async move { import::import_rows(&pool, parsed, truncate, now).await })
        });

    match result {
        Ok(report) => {
            for err in &report.errors {
                eprintln!("skipped {err}");
            }
            println!(
                "Imported cars={} skipped={} truncate={}",
                report.imported, report.skipped, truncate
            );
            record_system_event(
                "cli-import-cars",
                200,
                json!({ "path": path, "imported": report.imported, "skipped": report.skipped }),
            );
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("import failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run_dedupe_cli(args: &[String]) -> ! {
    let mut dry_run = false;
    for arg in args {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            other => {
                eprintln!("unknown dedupe option: {other}");
                std::process::exit(2);
            }
        }
    }

    let result = with_db(move |pool| async move {
        let sets = import::find_duplicates(&pool).await?;
        let removed = if dry_run {
            0
        } else {
            import::remove_duplicates(&pool, &sets).await?
        };
        Ok::<_, sqlx::Error>((sets, removed))
    });

    match result {
        Ok((sets, removed)) => {
            for set in &sets {
                println!("keep id={} duplicates={:?}", set.keep, set.remove);
            }
            println!(
                "Duplicate groups={} removed={} dry_run={}",
                sets.len(),
                removed,
                dry_run
            );
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("dedupe failed: {err}");
            std::process::exit(1);
        }
    }
}

fn take_value(args: &[String], idx: &mut usize, label: &str) -> String {
    *idx += 1;
    match args.get(*idx) {
        Some(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => {
            eprintln!("missing value for {label}");
            std::process::exit(2);
        }
    }
}

fn run_create_user_cli(args: &[String]) -> ! {
    let mut username = None;
    let mut email = None;
    let mut password = None;
    let mut role = "user".to_string();

    let mut idx = 0;
    while idx < args.len() {
        match args[idx].as_str() {
            "--username" => username = Some(take_value(args, &mut idx, "--username")),
            "--email" => email = Some(take_value(args, &mut idx, "--email")),
            "--password" => password = Some(take_value(args, &mut idx, "--password")),
            "--role" => role = take_value(args, &mut idx, "--role").to_ascii_lowercase(),
            other => {
                eprintln!("unknown create-user option: {other}");
                std::process::exit(2);
            }
        }
        idx += 1;
    }

    let (Some(username), Some(email), Some(password)) = (username, email, password) else {
        eprintln!("create-user requires --username, --email and --password");
        std::process::exit(2);
    };
    if role != "user" && role != "admin" {
        eprintln!("--role must be user or admin");
        std::process::exit(2);
    }
    if !password::valid_username(&username) {
        eprintln!("invalid username: 3-50 characters of letters, digits, underscores and hyphens");
        std::process::exit(2);
    }
    if !password::valid_email(&email) {
        eprintln!("invalid email address");
        std::process::exit(2);
    }
    if let Err(issue) = password::check_password_strength(&password) {
        eprintln!("{}", issue.message());
        std::process::exit(2);
    }

    let hash = match password::hash_password(&password) {
        Ok(hash) => hash,
        Err(err) => {
            eprintln!("failed to hash password: {err}");
            std::process::exit(1);
        }
    };

    let now = current_unix_secs() as i64;
    let created = with_db({
        let username = username.clone();
        move |pool| async move {
            if users::username_taken(&pool, &username).await?
                || users::find_by_email(&pool, &email).await?.is_some()
            {
                return Ok(None);
            }
            users::create_user(&pool, &username, email.trim(), Some(&hash), &role, now)
                .await
                .map(Some)
        }
    });

    match created {
        Ok(Some(id)) => {
            println!("Created user id={id} username={username}");
            std::process::exit(0);
        }
        Ok(None) => {
            eprintln!("username or email already exists");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("create-user failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run_hash_password_cli(args: &[String]) -> ! {
    let Some(plain) = args.first().filter(|v| !v.is_empty()) else {
        eprintln!("hash-password requires a password argument");
        std::process::exit(2);
    };
    match password::hash_password(plain) {
        Ok(hash) => {
            println!("{hash}");
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("failed to hash password: {err}");
            std::process::exit(1);
        }
    }
}

fn run_prune_cli(args: &[String]) -> ! {
    let mut dry_run = false;
    for arg in args {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            other => {
                eprintln!("unknown prune option: {other}");
                std::process::exit(2);
            }
        }
    }

    let now = current_unix_secs() as i64;
    let result = with_db(move |pool| async move {
        maintenance::prune_stale_records(&pool, now, maintenance::HISTORY_RETENTION_SECS, dry_run)
            .await
    });

    match result {
        Ok(report) => {
            println!(
                "Removed refresh_tokens={} reset_tokens={} login_attempts={} rate_limit_tokens={} dry_run={}",
                report.refresh_tokens,
                report.reset_tokens,
                report.login_attempts,
                report.rate_limit_tokens,
                dry_run
            );
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("prune failed: {err}");
            std::process::exit(1);
        }
    }
}

fn print_usage(exe: &str) {
    eprintln!("Usage: {exe} <command> [options]\n");
    eprintln!("Commands:");
    eprintln!("  server                       Handle one HTTP request on stdin/stdout");
    eprintln!(
        "  http-server                  Run the HTTP server bound to {ENV_HTTP_ADDR} (default {DEFAULT_HTTP_ADDR})"
    );
    eprintln!("  import-cars <csv> [options]  Bulk import listings (--truncate, --featured-ratio <0..1>)");
    eprintln!("  dedupe-cars [--dry-run]      Remove duplicate listings");
    eprintln!("  create-user [options]        --username U --email E --password P [--role user|admin]");
    eprintln!("  hash-password <password>     Print a bcrypt hash");
    eprintln!("  prune-tokens [--dry-run]     Delete stale tokens and login history");
    eprintln!("  version                      Print the release tag");
    eprintln!("  help                         Show this message");
    eprintln!("\nProfile: {ENV_PROFILE}=dev|test|prod");
}

fn is_api_route(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

fn handle_connection() -> Result<(), String> {
    let received_at = SystemTime::now();
    let started_at = Instant::now();
    let request_id = next_request_id();

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(|e| e.to_string())?;
    let request_line = request_line.trim_end_matches(['\r', '\n']).to_string();

    let (method, raw_target) = parse_request_line(&request_line);
    if method.is_empty() || raw_target.is_empty() {
        log_message(&format!("400 bad-request {}", redact_token(&request_line)));
        return send_basic_error(400, "Bad request");
    }

    let (path, query) = match parse_target(&raw_target) {
        Ok(parts) => parts,
        Err(err) => {
            log_message(&format!(
                "400 bad-request {} err={err}",
                redact_token(&request_line)
            ));
            return send_basic_error(400, "Bad request");
        }
    };

    let headers = read_headers(&mut reader)?;
    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok());
    let chunked = headers
        .get("transfer-encoding")
        .map(|enc| enc.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    // Only read a body when one is announced; reading to EOF would block on
    // clients that keep the socket open.
    let mut body = Vec::new();
    if let Some(len) = content_length {
        if len > MAX_BODY_BYTES {
            log_message(&format!("413 body-too-large len={len} path={path}"));
            return send_basic_error(413, "Payload too large");
        }
        body.resize(len, 0);
        reader
            .read_exact(&mut body)
            .map_err(|e| format!("failed to read body: {e}"))?;
    } else if chunked {
        body = match read_chunked_body(&mut reader) {
            Ok(body) => body,
            Err(err) if err == "body-too-large" => {
                log_message(&format!("413 body-too-large chunked path={path}"));
                return send_basic_error(413, "Payload too large");
            }
            Err(err) => return Err(err),
        };
    }

    let remote_addr = env::var(ENV_REMOTE_ADDR)
        .ok()
        .filter(|v| !v.trim().is_empty());

    let ctx = RequestContext::new(
        method,
        path,
        query,
        headers,
        body,
        request_line,
        request_id,
        remote_addr,
        started_at,
        received_at,
    );

    if ctx.method == "OPTIONS" {
        respond_preflight(&ctx)?;
    } else if ctx.method == "GET" && ctx.path == "/health" {
        handle_health(&ctx)?;
    } else if is_api_route(&ctx.path, "/api/auth") {
        auth::handle_auth_api(&ctx)?;
    } else if is_api_route(&ctx.path, "/api/cars") {
        cars::handle_cars_api(&ctx)?;
    } else if is_api_route(&ctx.path, "/api/carousel-images") {
        carousel::handle_carousel_api(&ctx)?;
    } else if is_api_route(&ctx.path, "/api/upload") {
        upload::handle_upload_api(&ctx)?;
    } else if static_files::try_serve_static(&ctx)? {
        // served from disk
    } else {
        log_message(&format!("404 {}", redact_token(&ctx.raw_request)));
        respond_error(&ctx, 404, "Not found", "not-found")?;
    }

    Ok(())
}

fn handle_health(ctx: &RequestContext) -> Result<(), String> {
    // Forces pool init so migration or permission problems show up here.
    let _ = db_pool();
    let db = db_status();

    let mut issues = Vec::new();
    if let Some(err) = &db.error {
        issues.push(json!({
            "component": "database",
            "message": err,
            "hint": format!("Set {ENV_DB_URL} to a writable sqlite:// path"),
        }));
    }
    if config().jwt_secret.is_none() {
        issues.push(json!({
            "component": "auth",
            "message": "JWT secret is not configured",
            "hint": format!("Set {ENV_JWT_SECRET}"),
        }));
    }

    let status = if issues.is_empty() { 200 } else { 503 };
    let payload = if issues.is_empty() {
        json!({ "status": "ok" })
    } else {
        json!({ "status": "degraded", "issues": issues })
    };
    respond_json(
        ctx,
        status,
        &payload,
        "health-check",
        Some(json!({ "db_url": db.url, "profile": config().profile.as_str() })),
    )
}
