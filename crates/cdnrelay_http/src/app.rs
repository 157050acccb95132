use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use cdnrelay_cloud::CloudError;
use cdnrelay_core::{Relay, RelayError, UploadFailure};
use cdnrelay_storage::CustomFileStore;
use cdnrelay_transfer::{
    extension_for, is_signatureless, mime_for_name, sniff, CustomFileRecord, Payload,
    UnknownUploadMode, UploadMode, UploadTarget, SNIFF_LEN,
};
use chrono::{Datelike, Utc};
use futures::future::try_join_all;
use mime::Mime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::format::{format_bytes, format_runtime};
use crate::rate_limit::{rate_limit, RateLimiter};

type ApiError = (StatusCode, Json<Value>);

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    /// Base for returned links. Falls back to the request `Host`.
    pub public_url: Option<String>,
    pub require_auth: bool,
    pub auth_tokens: Vec<String>,
    pub max_file_size_mb: u64,
    pub max_files: usize,
    pub cache_ttl_secs: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub custom_filenames: bool,
    /// Accepted media types; empty accepts everything.
    pub allowed_types: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            public_url: None,
            require_auth: false,
            auth_tokens: Vec::new(),
            max_file_size_mb: 100,
            max_files: 10,
            cache_ttl_secs: 3600,
            rate_limit_max: 100,
            rate_limit_window_secs: 60,
            custom_filenames: false,
            allowed_types: default_allowed_types(),
        }
    }
}

impl HttpConfig {
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(MB)
    }

    fn max_body_bytes(&self) -> usize {
        let files = self.max_files.max(1) as u64;
        let bytes = self.max_file_bytes().saturating_mul(files).saturating_add(MB);
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }

    fn allows(&self, media_type: &Mime) -> bool {
        self.allowed_types.is_empty()
            || self
                .allowed_types
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(media_type.essence_str()))
    }
}

fn default_allowed_types() -> Vec<String> {
    [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "image/svg+xml",
        "image/bmp",
        "image/tiff",
        "video/mp4",
        "video/mpeg",
        "video/quicktime",
        "video/x-msvideo",
        "video/webm",
        "video/x-flv",
        "video/3gpp",
        "video/x-ms-wmv",
        "audio/mpeg",
        "audio/wav",
        "audio/ogg",
        "audio/mp4",
        "audio/aac",
        "audio/webm",
        "audio/flac",
        "audio/x-ms-wma",
        "text/plain",
        "text/html",
        "text/css",
        "text/javascript",
        "text/csv",
        "text/xml",
        "application/json",
        "application/xml",
        "application/pdf",
        "application/msword",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/vnd.ms-excel",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "application/vnd.ms-powerpoint",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "application/zip",
        "application/x-rar-compressed",
        "application/x-7z-compressed",
        "application/gzip",
        "application/x-tar",
        "application/octet-stream",
        "application/x-executable",
        "application/x-sharedlib",
        "application/x-deb",
        "application/x-rpm",
        "application/vnd.android.package-archive",
        "application/x-msdownload",
        "application/x-apple-diskimage",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDeleteConfig {
    pub enabled: bool,
    pub minutes: i64,
    pub sweep_interval_secs: u64,
}

impl Default for AutoDeleteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            minutes: 1440,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub config: Arc<HttpConfig>,
    pub auto_delete: AutoDeleteConfig,
    pub limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, config: HttpConfig, auto_delete: AutoDeleteConfig) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limit_max,
            Duration::from_secs(config.rate_limit_window_secs),
        );
        Self {
            relay,
            config: Arc::new(config),
            auto_delete,
            limiter: Arc::new(limiter),
            started_at: Instant::now(),
        }
    }

    /// Custom filenames are on only when configured and the store can keep them.
    fn custom_files(&self) -> Option<&dyn CustomFileStore> {
        if self.config.custom_filenames {
            self.relay.store().custom_files()
        } else {
            None
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes();
    Router::new()
        .route("/upload", post(upload))
        .route("/media/{*token}", get(media))
        .route("/file/{name}", get(custom_file))
        .route("/delete/{*path}", delete(delete_file))
        .route("/info", get(info))
        .route("/health", get(health))
        .route("/accounts", get(accounts))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

struct IncomingFile {
    name: String,
    extension: &'static str,
    media_type: String,
    payload: Payload,
}

async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;

    let mut mode = UploadMode::Single;
    let mut email = None;
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| api_error(err.status(), "invalid_multipart", err.body_text()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        if field.file_name().is_none() {
            let value = field.text().await.map_err(|err| {
                api_error(err.status(), "invalid_multipart", err.body_text())
            })?;
            match field_name.as_str() {
                "mode" => {
                    mode = value.parse().map_err(|err: UnknownUploadMode| {
                        api_error(StatusCode::BAD_REQUEST, "invalid_mode", err.to_string())
                    })?
                }
                "email" => email = Some(value.trim().to_string()).filter(|v| !v.is_empty()),
                _ => {}
            }
            continue;
        }

        if files.len() >= state.config.max_files {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "too_many_files",
                format!("at most {} files per request", state.config.max_files),
            ));
        }

        let declared = declared_media_type(field.content_type(), field.file_name());
        let payload = state
            .relay
            .materialize(field, state.config.max_file_bytes())
            .await
            .map_err(relay_error)?;
        let head = payload
            .head(SNIFF_LEN)
            .await
            .map_err(|err| relay_error(RelayError::UploadFailed(err.into())))?;

        let (media_type, extension) = match resolve_media_type(&head, declared) {
            Some((media_type, extension)) if state.config.allows(&media_type) => {
                (media_type, extension)
            }
            rejected => {
                let detected = rejected
                    .map(|(media_type, _)| media_type.essence_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    "unsupported_type",
                    format!("Invalid: {detected}"),
                ));
            }
        };

        files.push(IncomingFile {
            name: generated_name(extension),
            extension,
            media_type: media_type.essence_str().to_string(),
            payload,
        });
    }

    if files.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "no_files", "no files uploaded"));
    }

    let target = UploadTarget {
        email: if mode == UploadMode::Dual { email } else { None },
    };
    let uploads = try_join_all(files.iter().map(|file| {
        state
            .relay
            .upload_payload(&file.name, &file.payload, mode, &target)
    }))
    .await
    .map_err(relay_error)?;

    if state.auto_delete.enabled {
        for uploaded in &uploads {
            state
                .relay
                .schedule_delete(&uploaded.name, state.auto_delete.minutes)
                .await
                .map_err(relay_error)?;
        }
    }

    let origin = origin(&state, &headers);
    let custom_store = state.custom_files();
    let mut out = Vec::with_capacity(uploads.len());
    for (uploaded, file) in uploads.iter().zip(&files) {
        let url = match custom_store {
            Some(custom) => {
                let custom_file_name =
                    format!("{}.{}", &Uuid::new_v4().simple().to_string()[..8], file.extension);
                custom
                    .save_custom_file(&CustomFileRecord {
                        custom_file_name: custom_file_name.clone(),
                        original_remote_url: uploaded.remote_url.clone(),
                        file_extension: file.extension.to_string(),
                    })
                    .await
                    .map_err(|err| relay_error(err.into()))?;
                format!("{origin}/file/{custom_file_name}")
            }
            None => {
                let token = state
                    .relay
                    .cloud()
                    .media_token(&uploaded.remote_url)
                    .map_err(|err| relay_error(err.into()))?;
                format!("{origin}/media/{token}")
            }
        };

        let mut entry = json!({
            "url": url,
            "name": uploaded.name,
            "size": uploaded.size,
            "formattedSize": format_bytes(uploaded.size),
            "mime": file.media_type,
        });
        if state.auto_delete.enabled {
            let seconds = u64::try_from(state.auto_delete.minutes)
                .unwrap_or(0)
                .saturating_mul(60);
            entry["expires"] = json!(format!("{seconds}s"));
            entry["formattedExpires"] = json!(format_runtime(seconds));
        }
        out.push(entry);
    }

    info!(files = out.len(), mode = mode.as_str(), "upload request served");
    Ok(Json(json!({ "success": true, "files": out })))
}

async fn media(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let remote_url = state
        .relay
        .cloud()
        .url_from_media_token(&token)
        .map_err(cloud_error)?;
    stream_remote(&state, &remote_url, None).await
}

async fn custom_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let custom = state
        .custom_files()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "custom_filenames_disabled", "Not enabled"))?;
    let record = custom
        .get_custom_file(&name)
        .await
        .map_err(|err| relay_error(err.into()))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "file_not_found", "Not found"))?;
    stream_remote(&state, &record.original_remote_url, Some(&name)).await
}

async fn stream_remote(
    state: &AppState,
    remote_url: &str,
    display_name: Option<&str>,
) -> Result<Response, ApiError> {
    let (file, body) = state
        .relay
        .cloud()
        .download(remote_url)
        .await
        .map_err(cloud_error)?;
    let file_name = display_name.unwrap_or(&file.name).replace('"', "");

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&file.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.size));
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{file_name}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={}", state.config.cache_ttl_secs)) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    Ok(response)
}

async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;

    let (remote_url, custom_name) = if let Some(id) = path.strip_prefix("file/") {
        let custom = state.custom_files().ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "custom_filenames_disabled",
                "Custom filenames not enabled",
            )
        })?;
        let record = custom
            .get_custom_file(id)
            .await
            .map_err(|err| relay_error(err.into()))?
            .ok_or_else(|| {
                api_error(StatusCode::NOT_FOUND, "file_not_found", "File not found in database")
            })?;
        (record.original_remote_url, Some(id.to_string()))
    } else if let Some(token) = path.strip_prefix("media/") {
        let url = state
            .relay
            .cloud()
            .url_from_media_token(token)
            .map_err(cloud_error)?;
        (url, None)
    } else {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid_path", "Invalid path."));
    };

    let outcome = match state.relay.file_name_from_url(&remote_url).await {
        Ok(name) => state
            .relay
            .delete_file_by_name(&name)
            .await
            .map(|deleted| deleted.then_some(name)),
        Err(err) => Err(err),
    };

    // The mapping goes away even when the remote file is already gone.
    let mut from_database = false;
    if let (Some(id), Some(custom)) = (&custom_name, state.custom_files()) {
        from_database = custom
            .delete_custom_file(id)
            .await
            .map_err(|err| relay_error(err.into()))?;
    }

    match outcome {
        Ok(Some(name)) => {
            if let Err(err) = state.relay.store().delete(&name).await {
                warn!(file = %name, error = %err, "could not drop deletion schedule");
            }
            Ok(Json(json!({
                "success": true,
                "message": "File deleted successfully",
                "deletedFrom": { "storage": true, "database": from_database }
            })))
        }
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            "file_not_found",
            "File not found in any account",
        )),
        Err(err) if matches!(err.kind(), "file_not_found" | "invalid_link") => Err(api_error(
            StatusCode::NOT_FOUND,
            "file_not_found",
            "File not found in storage",
        )),
        Err(err) => Err(relay_error(err)),
    }
}

async fn info(State(state): State<AppState>) -> impl IntoResponse {
    let config = &state.config;
    let mut body = json!({
        "request_limit": config.rate_limit_max,
        "rate_limit": format_runtime(config.rate_limit_window_secs),
        "file_size": config.max_file_size_mb,
        "max_files": config.max_files,
        "accounts": state.relay.account_count(),
        "uptime": format_runtime(state.started_at.elapsed().as_secs()),
    });
    if state.auto_delete.enabled {
        body["auto_delete_time"] = json!(state.auto_delete.minutes);
    }
    Json(body)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.relay.store();
    let database = if store.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "database": database,
        "database_type": store.backend(),
        "custom_filenames": state.custom_files().is_some(),
    }))
}

async fn accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let reports = state.relay.storage_info().await;
    Ok(Json(json!({
        "count": reports.len(),
        "accounts": reports,
    })))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.config.require_auth {
        return Ok(());
    }
    if state.config.auth_tokens.is_empty() {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "auth_misconfigured",
            "auth_token_required_but_not_configured",
        ));
    }

    let Some(provided) = headers.get(header::AUTHORIZATION) else {
        return Err(api_error(StatusCode::UNAUTHORIZED, "missing_auth", "Missing Auth"));
    };
    let token = provided
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "));
    match token {
        Some(token) if state.config.auth_tokens.iter().any(|key| key == token) => Ok(()),
        _ => Err(api_error(StatusCode::FORBIDDEN, "invalid_auth", "Invalid Auth")),
    }
}

/// Declared part type, or a guess from the file name when it is missing or generic.
fn declared_media_type(content_type: Option<&str>, file_name: Option<&str>) -> Mime {
    content_type
        .and_then(|raw| raw.parse::<Mime>().ok())
        .filter(|parsed| *parsed != mime::APPLICATION_OCTET_STREAM)
        .unwrap_or_else(|| mime_for_name(file_name.unwrap_or_default()))
}

/// Content signature first; the declared type is trusted only for text formats.
fn resolve_media_type(head: &[u8], declared: Mime) -> Option<(Mime, &'static str)> {
    match sniff(head) {
        Some(detected) => Some(detected),
        None if is_signatureless(&declared) => {
            let extension = extension_for(&declared);
            Some((declared, extension))
        }
        None => None,
    }
}

/// `D_M_YYYY_<6 chars>.<ext>`
fn generated_name(extension: &str) -> String {
    let now = Utc::now();
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}.{extension}",
        now.day(),
        now.month(),
        now.year(),
        &suffix[..6]
    )
}

fn origin(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(public_url) = &state.config.public_url {
        return public_url.trim_end_matches('/').to_string();
    }
    headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .map(|host| format!("http://{host}"))
        .unwrap_or_else(|| "http://localhost".to_string())
}

fn api_error(status: StatusCode, kind: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({ "error": message.into(), "kind": kind })),
    )
}

fn cloud_error(err: CloudError) -> ApiError {
    relay_error(RelayError::Cloud(err))
}

fn relay_error(err: RelayError) -> ApiError {
    let status = match &err {
        RelayError::UploadFailed(UploadFailure::TooLarge(_)) => StatusCode::PAYLOAD_TOO_LARGE,
        RelayError::Cloud(CloudError::NotFound(_)) => StatusCode::NOT_FOUND,
        err if err.is_client_error() => StatusCode::BAD_REQUEST,
        RelayError::UploadFailed(UploadFailure::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        RelayError::UploadFailed(_) | RelayError::Cloud(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!(kind = err.kind(), error = %err, "request failed");
    }
    let message = if matches!(err, RelayError::Persistence(_)) {
        "internal_error".to_string()
    } else {
        err.to_string()
    };
    api_error(status, err.kind(), message)
}
