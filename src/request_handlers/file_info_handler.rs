use axum::{
    extract::{Path, State},
    http::{header::CACHE_CONTROL, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use super::TusState;
use crate::error::TusResult;
use crate::filesystem::{file_store::FileStore, session::SessionState};
use crate::TusHeaderMap;

/// `HEAD {base}/:id`. Reports how far the upload got and keeps it alive.
///
/// A session stuck in `Completed` had its finalize fail earlier; the status
/// query is where the client learns about it, so the move is retried here.
pub async fn file_info_handler<T>(
    State(state): State<TusState<T>>,
    Path(id): Path<String>,
) -> TusResult<Response>
where
    T: FileStore + 'static,
{
    let mut status = state.engine.status(&id).await?;

    if status.state == SessionState::Completed {
        match state.engine.finalize(&id).await {
            Ok(artifact) => {
                tracing::info!(session_id = %id, permanent_id = %artifact.id, "finalize retried from status query");
                status = state.engine.status(&id).await?;
            }
            Err(e) => tracing::warn!(session_id = %id, error = %e, "finalize retry failed"),
        }
    }

    let upload_metadata = if status.metadata.is_empty() {
        None
    } else {
        Some(status.metadata.to_header_value())
    };

    let mut headers = TusHeaderMap {
        upload_offset: Some(status.received_offset),
        upload_length: i64::try_from(status.declared_length).ok(),
        upload_metadata,
        upload_expires: status.expires_at,
        permanent_id: status.permanent_id,
        ..Default::default()
    }
    .into_header_map();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok((StatusCode::OK, headers).into_response())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{app, create, patch, tus_request};
    use axum::body::Body;
    use http::{Method, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_head_reports_progress() {
        let dir = TempDir::new().unwrap();
        let (app, _engine) = app(&dir).await;
        let location = create(&app, 1000, "a.bin").await;
        patch(&app, &location, 0, &[7u8; 600]).await;

        let response = app
            .oneshot(tus_request(Method::HEAD, &location).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["upload-offset"], "600");
        assert_eq!(response.headers()["upload-length"], "1000");
        assert_eq!(response.headers()["upload-metadata"], "filename YS5iaW4=");
        assert_eq!(response.headers()["cache-control"], "no-store");
        assert!(response.headers().contains_key("upload-expires"));
    }

    #[tokio::test]
    async fn test_head_on_unknown_upload_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (app, _engine) = app(&dir).await;

        let response = app
            .oneshot(
                tus_request(Method::HEAD, "/files/tus/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_head_retries_failed_finalize() {
        let dir = TempDir::new().unwrap();
        let (app, engine) = app(&dir).await;
        let location = create(&app, 2, "late.bin").await;

        let uploads = engine.file_store().root_path().to_path_buf();
        std::fs::remove_dir_all(&uploads).unwrap();
        let response = patch(&app, &location, 0, b"ok").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        std::fs::create_dir_all(&uploads).unwrap();
        let response = app
            .oneshot(tus_request(Method::HEAD, &location).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["upload-permanent-id"], "late.bin");
        assert!(uploads.join("late.bin").exists());
    }
}
