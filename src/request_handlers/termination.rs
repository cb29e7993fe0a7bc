use axum::{
    extract::{Path, State},
    http::StatusCode,
};

use super::TusState;
use crate::error::TusResult;
use crate::filesystem::file_store::FileStore;

/// `DELETE {base}/:id`. Discards an unfinished upload.
pub async fn termination_handler<T>(
    State(state): State<TusState<T>>,
    Path(id): Path<String>,
) -> TusResult<StatusCode>
where
    T: FileStore + 'static,
{
    state.engine.cancel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{app, create, patch, tus_request};
    use axum::body::Body;
    use http::{Method, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_delete_discards_upload() {
        let dir = TempDir::new().unwrap();
        let (app, engine) = app(&dir).await;
        let location = create(&app, 10, "a.bin").await;
        let id = location.rsplit('/').next().unwrap().to_string();
        patch(&app, &location, 0, b"abc").await;

        let response = app
            .clone()
            .oneshot(tus_request(Method::DELETE, &location).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!engine.sessions().contains(&id));
        assert!(!engine.sessions().artifact_path(&id).exists());

        let response = patch(&app, &location, 3, b"def").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_after_finalize_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let (app, _engine) = app(&dir).await;
        let location = create(&app, 2, "a.bin").await;
        patch(&app, &location, 0, b"ok").await;

        let response = app
            .oneshot(tus_request(Method::DELETE, &location).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
