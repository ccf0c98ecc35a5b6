use crate::AppState;
use crate::api::error::ApiError;
use crate::services::dispatcher::DispatchError;
use crate::services::operations::Artifact;
use crate::services::staging::UploadError;
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State, multipart::MultipartRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use utoipa::ToSchema;

/// RFC 5987 attr-char, minus the few punctuation marks we leave unescaped
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_');

const X_OPERATION_STATUS: &str = "x-operation-status";
const X_ARTIFACT_FILENAME: &str = "x-artifact-filename";

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactResponse {
    /// Always "ok"
    pub status: String,
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    /// Artifact bytes, base64 encoded
    pub data: String,
}

#[utoipa::path(
    post,
    path = "/api/{operation}",
    params(
        ("operation" = String, Path, description = "Operation name, e.g. word2pdf or split")
    ),
    request_body(
        content = String,
        content_type = "multipart/form-data",
        description = "Exactly one file part, plus optional text fields such as `pages`"
    ),
    responses(
        (status = 200, description = "Artifact bytes, or a JSON envelope when Accept is application/json", body = ArtifactResponse),
        (status = 400, description = "Missing, extra, oversized or malformed upload", body = crate::api::error::ErrorResponse),
        (status = 404, description = "Unknown operation", body = crate::api::error::ErrorResponse),
        (status = 415, description = "The operation cannot process this file", body = crate::api::error::ErrorResponse),
        (status = 500, description = "Staging or operation failure", body = crate::api::error::ErrorResponse),
        (status = 504, description = "Operation timed out", body = crate::api::error::ErrorResponse)
    ),
    tag = "operations"
)]
pub async fn run_operation(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            // Unknown operations still answer 404 whatever the body looks like
            state.dispatcher.resolve(&operation)?;
            tracing::debug!("Request carries no multipart body: {}", rejection);
            return Err(UploadError::MissingFile.into());
        }
    };

    match state.dispatcher.handle(&operation, &mut multipart).await {
        Ok(artifact) => Ok(artifact_response(artifact, wants_json(&headers))),
        Err(e) => {
            if matches!(e, DispatchError::NotFound(_) | DispatchError::Upload(_)) {
                // Consume the rest of the body so the client sees our response
                // instead of a connection reset
                tracing::warn!("Upload rejected: {}. Consuming remaining stream...", e);
                drain(&mut multipart).await;
            }
            Err(e.into())
        }
    }
}

async fn drain(multipart: &mut Multipart) {
    while let Ok(Some(mut field)) = multipart.next_field().await {
        while let Ok(Some(_)) = field.chunk().await {}
    }
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("application/json"))
}

fn artifact_response(artifact: Artifact, json: bool) -> Response {
    if json {
        return Json(ArtifactResponse {
            status: "ok".to_string(),
            filename: artifact.filename.clone(),
            content_type: artifact.content_type.clone(),
            size: artifact.size(),
            data: base64::engine::general_purpose::STANDARD.encode(&artifact.bytes),
        })
        .into_response();
    }

    let content_type = HeaderValue::from_str(&artifact.content_type)
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    let ascii_name = ascii_filename(&artifact.filename);
    let disposition = HeaderValue::from_str(&content_disposition(&artifact.filename))
        .unwrap_or(HeaderValue::from_static("attachment"));
    let filename_header =
        HeaderValue::from_str(&ascii_name).unwrap_or(HeaderValue::from_static("artifact"));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
            (
                HeaderName::from_static(X_OPERATION_STATUS),
                HeaderValue::from_static("ok"),
            ),
            (HeaderName::from_static(X_ARTIFACT_FILENAME), filename_header),
        ],
        Body::from(artifact.bytes),
    )
        .into_response()
}

/// Printable ASCII stand-in for header contexts that cannot carry UTF-8
fn ascii_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_filename(filename),
        utf8_percent_encode(filename, FILENAME_ENCODE_SET)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("a_part1.pdf"),
            "attachment; filename=\"a_part1.pdf\"; filename*=UTF-8''a_part1.pdf"
        );
        assert_eq!(
            content_disposition("résumé \"final\".pdf"),
            "attachment; filename=\"r_sum_ _final_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9%20%22final%22.pdf"
        );
    }

    #[test]
    fn test_wants_json() {
        let mut headers = HeaderMap::new();
        assert!(!wants_json(&headers));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, */*"),
        );
        assert!(wants_json(&headers));
    }
}
