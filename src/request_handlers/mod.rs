//! axum adapters translating tus requests into engine calls.

pub mod creation;
pub mod file_info_handler;
pub mod info;
pub mod termination;
pub mod upload_handler;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{patch, post},
    Router,
};
use std::sync::Arc;

use crate::engine::UploadEngine;
use crate::filesystem::{file_store::FileStore, metadata::MetadataError};
use crate::tus_service::TusLayer;

/// Router state: the engine plus the path uploads are addressed under.
pub struct TusState<T> {
    pub engine: Arc<UploadEngine<T>>,
    pub base_path: String,
}

impl<T> Clone for TusState<T> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            base_path: self.base_path.clone(),
        }
    }
}

impl<T> TusState<T> {
    pub fn location(&self, id: &str) -> String {
        format!("{}/{}", self.base_path, id)
    }
}

/// Why a request never reached the engine.
#[derive(Debug, thiserror::Error)]
pub enum RequestRejection {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("invalid {0} header")]
    InvalidHeader(&'static str),
    #[error("content type must be application/offset+octet-stream")]
    UnsupportedMediaType,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(u64),
    #[error("failed to read request body: {0}")]
    Body(String),
}

impl IntoResponse for RequestRejection {
    fn into_response(self) -> Response {
        let status = match self {
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };

        tracing::debug!(error = %self, "rejected tus request");
        (status, self.to_string()).into_response()
    }
}

/// Mounts the tus endpoints under `base_path`:
///
/// - `OPTIONS {base}` and `OPTIONS {base}/:id` advertise server capabilities
/// - `POST {base}` creates an upload
/// - `HEAD {base}/:id` reports progress
/// - `PATCH {base}/:id` appends a chunk
/// - `DELETE {base}/:id` cancels an upload
pub fn tus_router<T>(engine: Arc<UploadEngine<T>>, base_path: &str) -> Router
where
    T: FileStore + 'static,
{
    let base_path = base_path.trim_end_matches('/').to_string();
    let collection = if base_path.is_empty() {
        "/".to_string()
    } else {
        base_path.clone()
    };
    let resource = format!("{}/:id", base_path);

    let state = TusState { engine, base_path };

    Router::new()
        .route(
            &collection,
            post(creation::creation_handler::<T>).options(info::info_handler::<T>),
        )
        .route(
            &resource,
            patch(upload_handler::upload_handler::<T>)
                .head(file_info_handler::file_info_handler::<T>)
                .delete(termination::termination_handler::<T>)
                .options(info::info_handler::<T>),
        )
        .layer(TusLayer::new())
        .with_state(state)
}
