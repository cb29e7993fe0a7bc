use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, State},
    http::{header::LOCATION, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use super::{RequestRejection, TusState};
use crate::error::TusResult;
use crate::filesystem::{file_store::FileStore, metadata::Metadata, session::SessionState};
use crate::{AxumTusHeaders, TusHeaderMap};

pub struct CreationRequest {
    upload_length: i64,
    metadata: Metadata,
}

pub async fn creation_handler<T>(
    State(state): State<TusState<T>>,
    req: CreationRequest,
) -> TusResult<Response>
where
    T: FileStore + 'static,
{
    let status = state.engine.create(req.upload_length, req.metadata).await?;
    let location = state.location(&status.id);

    let finalized = status.state == SessionState::Finalized;
    let mut headers = TusHeaderMap {
        upload_expires: status.expires_at,
        upload_offset: finalized.then_some(status.received_offset),
        permanent_id: status.permanent_id.clone(),
        ..Default::default()
    }
    .into_header_map();

    match HeaderValue::from_str(&location) {
        Ok(value) => {
            headers.insert(LOCATION, value);
        }
        Err(_) => tracing::warn!(%location, "upload location is not a valid header value"),
    }

    tracing::info!(
        session_id = %status.id,
        upload_length = status.declared_length,
        "created upload"
    );

    Ok((StatusCode::CREATED, headers).into_response())
}

#[async_trait]
impl<S> FromRequestParts<S> for CreationRequest
where
    S: Send + Sync,
{
    type Rejection = RequestRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header_map = TusHeaderMap::from_headers(&parts.headers)?;

        // Deferred lengths are not supported, so the length is mandatory.
        let upload_length = header_map
            .upload_length
            .ok_or(RequestRejection::MissingHeader(AxumTusHeaders::UploadLength.name()))?;

        let metadata = match header_map.upload_metadata.as_deref().map(str::trim) {
            None | Some("") => Metadata::new(),
            Some(raw) => Metadata::try_from(raw)?,
        };

        Ok(CreationRequest {
            upload_length,
            metadata,
        })
    }
}
