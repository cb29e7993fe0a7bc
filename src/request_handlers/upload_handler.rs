use async_trait::async_trait;
use axum::{
    body::HttpBody,
    extract::{FromRequest, Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    BoxError,
};
use bytes::Bytes;

use super::{RequestRejection, TusState};
use crate::error::TusResult;
use crate::filesystem::file_store::FileStore;
use crate::{AxumTusHeaders, TusHeaderMap};

const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub struct UploadRequest {
    upload_offset: u64,
    upload_bytes: Bytes,
}

pub async fn upload_handler<T>(
    State(state): State<TusState<T>>,
    Path(id): Path<String>,
    req: UploadRequest,
) -> TusResult<Response>
where
    T: FileStore + 'static,
{
    let outcome = state
        .engine
        .append(&id, req.upload_offset, &req.upload_bytes)
        .await?;

    if let Some(artifact) = &outcome.artifact {
        tracing::info!(
            session_id = %id,
            permanent_id = %artifact.id,
            length = artifact.length,
            "upload stored"
        );
    }

    let headers = TusHeaderMap {
        upload_offset: Some(outcome.status.received_offset),
        upload_expires: outcome.status.expires_at,
        permanent_id: outcome.status.permanent_id,
        ..Default::default()
    }
    .into_header_map();

    Ok((StatusCode::NO_CONTENT, headers).into_response())
}

fn is_offset_octet_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map_or(false, |mime| mime.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
}

#[async_trait]
impl<T, B> FromRequest<TusState<T>, B> for UploadRequest
where
    T: FileStore + 'static,
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Rejection = RequestRejection;

    async fn from_request(req: Request<B>, state: &TusState<T>) -> Result<Self, Self::Rejection> {
        let header_map = TusHeaderMap::from_headers(req.headers())?;

        let upload_offset = header_map
            .upload_offset
            .ok_or(RequestRejection::MissingHeader(AxumTusHeaders::UploadOffset.name()))?;

        if !is_offset_octet_stream(req.headers()) {
            return Err(RequestRejection::UnsupportedMediaType);
        }

        // No single chunk may be larger than the largest upload the server accepts.
        let max_size = state.engine.config().max_size;
        let limit = max_size
            .and_then(|max| usize::try_from(max).ok())
            .unwrap_or(usize::MAX);

        let body = http_body::Limited::new(req.into_body(), limit);
        let upload_bytes = hyper::body::to_bytes(body).await.map_err(|e| {
            if e.downcast_ref::<http_body::LengthLimitError>().is_some() {
                RequestRejection::BodyTooLarge(max_size.unwrap_or_default())
            } else {
                RequestRejection::Body(e.to_string())
            }
        })?;

        Ok(UploadRequest {
            upload_offset,
            upload_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{app, create, patch, tus_request};
    use super::*;
    use crate::filesystem::session::SessionState;
    use axum::body::Body;
    use http::Method;
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[test]
    fn test_content_type_parameters_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "Application/Offset+Octet-Stream; charset=binary".parse().unwrap());
        assert!(is_offset_octet_stream(&headers));

        headers.insert(CONTENT_TYPE, "application/octet-stream".parse().unwrap());
        assert!(!is_offset_octet_stream(&headers));
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let (app, _engine) = app(&dir).await;
        let location = create(&app, 10, "a.bin").await;

        let response = app
            .oneshot(
                tus_request(Method::PATCH, &location)
                    .header("upload-offset", "0")
                    .header("content-type", "text/plain")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_missing_offset_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let (app, _engine) = app(&dir).await;
        let location = create(&app, 10, "a.bin").await;

        let response = app
            .oneshot(
                tus_request(Method::PATCH, &location)
                    .header("content-type", OFFSET_OCTET_STREAM)
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_offset_mismatch_is_conflict() {
        let dir = TempDir::new().unwrap();
        let (app, engine) = app(&dir).await;
        let location = create(&app, 10, "a.bin").await;
        let id = location.rsplit('/').next().unwrap();

        let response = patch(&app, &location, 3, b"hello").await;

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(engine.status(id).await.unwrap().received_offset, 0);
    }

    #[tokio::test]
    async fn test_over_length_chunk_terminates_upload() {
        let dir = TempDir::new().unwrap();
        let (app, engine) = app(&dir).await;
        let location = create(&app, 4, "a.bin").await;
        let id = location.rsplit('/').next().unwrap();

        let response = patch(&app, &location, 0, b"hello").await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(engine.status(id).await.is_err());
    }

    #[tokio::test]
    async fn test_patch_after_finalize_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let (app, engine) = app(&dir).await;
        let location = create(&app, 2, "a.bin").await;
        let id = location.rsplit('/').next().unwrap();

        let response = patch(&app, &location, 0, b"ok").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(engine.status(id).await.unwrap().state, SessionState::Finalized);

        let response = patch(&app, &location, 2, b"more").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_resent_final_chunk_gets_same_answer() {
        let dir = TempDir::new().unwrap();
        let (app, _engine) = app(&dir).await;
        let location = create(&app, 2, "a.bin").await;

        let first = patch(&app, &location, 0, b"ok").await;
        let resent = patch(&app, &location, 0, b"ok").await;

        assert_eq!(resent.status(), StatusCode::NO_CONTENT);
        assert_eq!(resent.headers()["upload-offset"], first.headers()["upload-offset"]);
        assert_eq!(resent.headers()["upload-permanent-id"], "a.bin");
    }
}
