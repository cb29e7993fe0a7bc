use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque key/value metadata captured when an upload is created.
///
/// Values are kept decoded; the engine only looks inside at finalize time.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, String>);

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata value for {key} is not valid base64: {reason}")]
    DecodeError { key: String, reason: String },
    #[error("metadata value for {0} is not valid utf-8")]
    InvalidUtf8(String),
    #[error("malformed Upload-Metadata header")]
    InvalidMetadataFormat,
}

impl Metadata {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Declared file name, from `filename` or the older `name` key.
    pub fn filename(&self) -> Option<&str> {
        self.get("filename")
            .or_else(|| self.get("name"))
            .filter(|v| !v.trim().is_empty())
    }

    /// Declared content type, from `filetype` or `contentType`.
    pub fn content_type(&self) -> Option<&str> {
        self.get("filetype")
            .or_else(|| self.get("contentType"))
            .filter(|v| !v.trim().is_empty())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders the metadata back into `Upload-Metadata` form.
    pub fn to_header_value(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!(
                        "{} {}",
                        key,
                        base64::engine::general_purpose::STANDARD.encode(value)
                    )
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Metadata(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl TryFrom<&str> for Metadata {
    type Error = MetadataError;

    /// Parses an [`Upload-Metadata`](https://tus.io/protocols/resumable-upload.html#upload-metadata)
    /// header: comma separated `key base64value` pairs, the value being optional.
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(MetadataError::InvalidMetadataFormat);
        }

        let mut metadata = Metadata::new();

        for pair in value.split(',') {
            let pair = pair.trim();

            if pair.is_empty() {
                continue;
            }

            let parts: Vec<&str> = pair.split(' ').filter(|v| !v.is_empty()).collect();

            let (key, encoded) = match parts.as_slice() {
                [key] => (*key, None),
                [key, encoded] => (*key, Some(*encoded)),
                _ => return Err(MetadataError::InvalidMetadataFormat),
            };

            let value = match encoded {
                Some(encoded) => {
                    let raw = base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| MetadataError::DecodeError {
                            key: key.to_string(),
                            reason: e.to_string(),
                        })?;
                    String::from_utf8(raw).map_err(|_| MetadataError::InvalidUtf8(key.to_string()))?
                }
                None => String::default(),
            };

            metadata.0.insert(key.to_string(), value);
        }

        if metadata.is_empty() {
            return Err(MetadataError::InvalidMetadataFormat);
        }

        Ok(metadata)
    }
}
