use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::TusState;
use crate::filesystem::file_store::FileStore;
use crate::{TusHeaderMap, TUS_EXTENSIONS, TUS_VERSION};

/// `OPTIONS`. Advertises the protocol version, extensions and size limit.
pub async fn info_handler<T>(State(state): State<TusState<T>>) -> Response
where
    T: FileStore + 'static,
{
    let headers = TusHeaderMap {
        version: Some(vec![TUS_VERSION.to_string()]),
        extensions: Some(TUS_EXTENSIONS.iter().map(|e| e.to_string()).collect()),
        max_size: state.engine.config().max_size,
        ..Default::default()
    }
    .into_header_map();

    (StatusCode::NO_CONTENT, headers).into_response()
}
