pub mod config;
pub mod engine;
pub mod error;
pub mod filesystem;
pub mod finalize;
pub mod request_handlers;
pub mod sweeper;
mod tus_service;

pub use config::{Config, EngineConfig, ServerConfig};
pub use engine::{AppendOutcome, UploadEngine, UploadStatus};
pub use error::{TusError, TusResult};
pub use filesystem::file_store::{FileStore, LocalFileStore};
pub use filesystem::metadata::Metadata;
pub use filesystem::session::SessionState;
pub use finalize::PermanentArtifact;
pub use request_handlers::{tus_router, RequestRejection};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use tus_service::TusLayer;

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &[&str] = &["creation", "termination", "expiration"];

// TUS Headers for its protocol
#[derive(Debug, Clone, Copy)]
pub enum AxumTusHeaders {
    MaxSize,
    Extensions,
    Version,
    Resumable,
    UploadLength,
    UploadOffset,
    UploadMetadata,
    UploadExpires,
    /// Not part of tus: names the permanent artifact a finished upload became.
    UploadPermanentId,
}

impl AxumTusHeaders {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MaxSize => "tus-max-size",
            Self::Extensions => "tus-extension",
            Self::Version => "tus-version",
            Self::Resumable => "tus-resumable",
            Self::UploadLength => "upload-length",
            Self::UploadOffset => "upload-offset",
            Self::UploadMetadata => "upload-metadata",
            Self::UploadExpires => "upload-expires",
            Self::UploadPermanentId => "upload-permanent-id",
        }
    }

    pub fn header_name(&self) -> HeaderName {
        HeaderName::from_static(self.name())
    }
}

/// The tus headers of one request or response.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TusHeaderMap {
    pub max_size: Option<u64>,
    pub extensions: Option<Vec<String>>,
    pub version: Option<Vec<String>>,
    pub resumable: Option<String>,
    /// Signed so a negative length reaches the engine and is refused there.
    pub upload_length: Option<i64>,
    pub upload_metadata: Option<String>,
    pub upload_offset: Option<u64>,
    pub upload_expires: Option<DateTime<Utc>>,
    pub permanent_id: Option<String>,
}

impl TusHeaderMap {
    pub fn with_tus_version() -> Self {
        Self {
            resumable: Some(TUS_VERSION.to_string()),
            ..Default::default()
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<TusHeaderMap, RequestRejection> {
        let mut tus_header_map = TusHeaderMap::default();

        if let Some(maxsize) = header_str(headers, AxumTusHeaders::MaxSize)? {
            tus_header_map.max_size = Some(parse_number(maxsize, AxumTusHeaders::MaxSize)?);
        }

        if let Some(extensions) = header_str(headers, AxumTusHeaders::Extensions)? {
            tus_header_map.extensions = Some(split_list(extensions));
        }

        if let Some(version) = header_str(headers, AxumTusHeaders::Version)? {
            tus_header_map.version = Some(split_list(version));
        }

        if let Some(resumable) = header_str(headers, AxumTusHeaders::Resumable)? {
            tus_header_map.resumable = Some(resumable.trim().to_string());
        }

        if let Some(upload_length) = header_str(headers, AxumTusHeaders::UploadLength)? {
            tus_header_map.upload_length = Some(parse_number(upload_length, AxumTusHeaders::UploadLength)?);
        }

        if let Some(upload_offset) = header_str(headers, AxumTusHeaders::UploadOffset)? {
            tus_header_map.upload_offset = Some(parse_number(upload_offset, AxumTusHeaders::UploadOffset)?);
        }

        if let Some(upload_metadata) = header_str(headers, AxumTusHeaders::UploadMetadata)? {
            tus_header_map.upload_metadata = Some(upload_metadata.to_string());
        }

        Ok(tus_header_map)
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some(max_size) = &self.max_size {
            insert(headers, AxumTusHeaders::MaxSize, max_size.to_string());
        }

        if let Some(extensions) = &self.extensions {
            insert(headers, AxumTusHeaders::Extensions, extensions.join(","));
        }

        if let Some(version) = &self.version {
            insert(headers, AxumTusHeaders::Version, version.join(","));
        }

        if let Some(resumable) = &self.resumable {
            insert(headers, AxumTusHeaders::Resumable, resumable.clone());
        }

        if let Some(upload_length) = &self.upload_length {
            insert(headers, AxumTusHeaders::UploadLength, upload_length.to_string());
        }

        if let Some(upload_metadata) = &self.upload_metadata {
            insert(headers, AxumTusHeaders::UploadMetadata, upload_metadata.clone());
        }

        if let Some(upload_offset) = &self.upload_offset {
            insert(headers, AxumTusHeaders::UploadOffset, upload_offset.to_string());
        }

        if let Some(expires) = &self.upload_expires {
            insert(headers, AxumTusHeaders::UploadExpires, http_date(expires));
        }

        if let Some(permanent_id) = &self.permanent_id {
            insert(headers, AxumTusHeaders::UploadPermanentId, permanent_id.clone());
        }
    }

    pub fn into_header_map(self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.apply(&mut headers);
        headers
    }
}

fn header_str(headers: &HeaderMap, header: AxumTusHeaders) -> Result<Option<&str>, RequestRejection> {
    match headers.get(header.name()) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| RequestRejection::InvalidHeader(header.name())),
    }
}

fn parse_number<T: FromStr>(value: &str, header: AxumTusHeaders) -> Result<T, RequestRejection> {
    T::from_str(value.trim()).map_err(|_| RequestRejection::InvalidHeader(header.name()))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn insert(headers: &mut HeaderMap, header: AxumTusHeaders, value: String) {
    match HeaderValue::from_str(&value) {
        Ok(value) => {
            headers.insert(header.header_name(), value);
        }
        Err(_) => tracing::warn!(header = header.name(), "dropping unrepresentable header value"),
    }
}

/// RFC 7231 `HTTP-date`, the format `Upload-Expires` uses.
pub fn http_date(at: &DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
