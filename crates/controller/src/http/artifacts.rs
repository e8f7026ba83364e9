use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::header::{
    CONTENT_LENGTH, CONTENT_TYPE, HOST, IF_MODIFIED_SINCE, LAST_MODIFIED,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SubsecRound, Utc};
use metrics::{counter, histogram};
use tracing::{info, warn};

use common::api::{ArtifactUploadResponse, UploadedArtifact};

use crate::app_state::AppState;
use crate::artifacts::{ArtifactError, SaveRequest};
use crate::auth;
use crate::error::{ApiResult, AppError};

/// `POST /api/admin/v1/artifacts`: multipart upload with mandatory
/// `file` and `version` parts and an optional `signature`.
pub(crate) async fn upload_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<ArtifactUploadResponse>> {
    auth::require_admin(&headers, &state.cfg.admin_bearer_token)?;

    let mut version = String::new();
    let mut artifact: Option<(String, Vec<u8>)> = None;
    let mut signature: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| AppError::bad_request("invalid multipart form"))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "version" => {
                version = field
                    .text()
                    .await
                    .map_err(|_| AppError::bad_request("invalid multipart form"))?
                    .trim()
                    .to_string();
            }
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| AppError::bad_request("invalid multipart form"))?;
                artifact = Some((name, bytes.to_vec()));
            }
            "signature" => {
                let name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| AppError::bad_request("invalid signature field"))?;
                signature = Some((name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let (artifact_name, artifact_bytes) =
        artifact.ok_or_else(|| AppError::bad_request("file field is required"))?;
    if version.is_empty() {
        return Err(AppError::bad_request("version is required"));
    }

    let (signature_name, signature_bytes) = match signature {
        Some((name, bytes)) => (name, Some(bytes)),
        None => (String::new(), None),
    };

    let started = std::time::Instant::now();
    let meta = state
        .artifacts
        .save(SaveRequest {
            version,
            artifact_name,
            artifact: Some(Box::new(futures_util::io::Cursor::new(artifact_bytes))),
            signature: signature_bytes
                .map(|bytes| -> crate::artifacts::ArtifactSource {
                    Box::new(futures_util::io::Cursor::new(bytes))
                }),
            signature_name,
        })
        .await
        .map_err(|err| match err {
            ArtifactError::ArtifactRequired => AppError::bad_request("artifact required"),
            err => {
                warn!(%err, "save artifact failed");
                counter!("controller_artifact_upload_failures_total").increment(1);
                AppError::internal("unable to save artifact")
            }
        })?;
    let elapsed = started.elapsed();

    info!(
        artifact = %meta.artifact_name,
        size = meta.size,
        duration_ms = elapsed.as_millis() as u64,
        "artifact uploaded"
    );
    counter!("controller_artifact_uploads_total").increment(1);
    histogram!("controller_artifact_upload_bytes").record(meta.size as f64);

    let download_url = build_artifact_url(&state, &headers, &meta.artifact_name);
    let signature_url = if meta.signature_name.is_empty() {
        None
    } else {
        Some(build_artifact_url(&state, &headers, &meta.signature_name))
    };

    Ok(Json(ArtifactUploadResponse {
        artifact: UploadedArtifact {
            name: meta.artifact_name,
            download_url,
            sha256: meta.sha256,
            size: meta.size,
            signature_url,
        },
    }))
}

/// `GET <artifact_path>/{name}`: serves a stored artifact with
/// content-type detection and Last-Modified conditional handling.
pub(crate) async fn download_artifact(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let (reader, meta) = state.artifacts.open(&name).await.map_err(|err| match err {
        ArtifactError::NotFound => AppError::not_found("artifact not found"),
        ArtifactError::NameRequired => AppError::bad_request("artifact name required"),
        err => {
            warn!(%err, "artifact open failed");
            AppError::internal("internal server error")
        }
    })?;

    let modified = meta.created_at.trunc_subsecs(0);
    if let Some(since) = headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
    {
        if modified <= since {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    let stream = futures_util::stream::try_unfold(reader, |mut reader| async move {
        let mut buf = vec![0u8; 64 * 1024];
        let n = tokio::io::AsyncReadExt::read(&mut reader, &mut buf).await?;
        if n == 0 {
            Ok::<_, std::io::Error>(None)
        } else {
            buf.truncate(n);
            Ok(Some((axum::body::Bytes::from(buf), reader)))
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&meta.artifact_name)),
    );
    if let Ok(value) = HeaderValue::from_str(&meta.size.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format_http_date(modified)) {
        headers.insert(LAST_MODIFIED, value);
    }
    Ok(response)
}

fn build_artifact_url(state: &AppState, headers: &HeaderMap, name: &str) -> String {
    let base = state.cfg.public_base_url.trim();
    let base = if base.is_empty() {
        let host = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{host}")
    } else {
        base.trim_end_matches('/').to_string()
    };
    format!("{base}{}/{name}", state.cfg.artifact_route())
}

fn content_type_for(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        "application/gzip"
    } else if lower.ends_with(".tar.xz") {
        "application/x-xz"
    } else if lower.ends_with(".tar.bz2") {
        "application/x-bzip2"
    } else if lower.ends_with(".json") {
        "application/json"
    } else if lower.ends_with(".txt") {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

fn format_http_date(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
