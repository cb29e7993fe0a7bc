use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

const DEFAULT_FILE_NAME: &str = "file";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A finished file as the permanent store hands it back.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: String,
    pub bytes: Bytes,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The permanent namespace finished uploads land in. Identifiers are the
/// resolved file names, so `store` and `adopt` must share one collision rule.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn store(&self, bytes: Bytes, declared_name: &str, content_type: &str) -> Result<String, FileStoreError>;
    async fn fetch(&self, id: &str) -> Result<StoredFile, FileStoreError>;
    async fn delete(&self, id: &str) -> Result<bool, FileStoreError>;
    async fn list_metadata(&self) -> Result<Vec<FileMetadata>, FileStoreError>;
    async fn exists(&self, id: &str) -> bool;
    /// Moves `source` into the namespace under a collision-free version of
    /// `declared_name`. Rename semantics: readers never see a partial file.
    async fn adopt(&self, source: &Path, declared_name: &str) -> Result<String, FileStoreError>;
}

/// Keeps only the final path component of a client supplied name.
/// Returns `None` when nothing usable is left (`..`, `/`, empty, NUL bytes).
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return None;
    }

    Some(base.to_string())
}

/// The `attempt`th candidate for `name`: the name itself, then
/// `stem-YYYYMMDDHHMMSS.ext`, then `stem-YYYYMMDDHHMMSS-N.ext`.
pub fn candidate_name(name: &str, at: DateTime<Utc>, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }

    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let stamp = at.format("%Y%m%d%H%M%S");

    if attempt == 1 {
        format!("{stem}-{stamp}{extension}")
    } else {
        format!("{stem}-{stamp}-{}{extension}", attempt - 1)
    }
}

pub struct LocalFileStore {
    root_path: PathBuf,
    /// Held while a name is resolved and claimed.
    naming: Mutex<()>,
}

impl LocalFileStore {
    pub async fn new(root_path: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
        let root_path = root_path.into();
        fs::create_dir_all(&root_path).await?;

        Ok(Self {
            root_path,
            naming: Mutex::new(()),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn file_path(&self, id: &str) -> Result<PathBuf, FileStoreError> {
        match sanitize_file_name(id) {
            Some(safe) if safe == id => Ok(self.root_path.join(safe)),
            _ => Err(FileStoreError::InvalidName(id.to_string())),
        }
    }

    /// Must be called with `naming` held.
    async fn resolve_name(&self, declared_name: &str) -> Result<String, FileStoreError> {
        let safe = sanitize_file_name(declared_name).unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
        let now = Utc::now();

        let mut attempt = 0;
        loop {
            let candidate = candidate_name(&safe, now, attempt);
            if !fs::try_exists(self.root_path.join(&candidate)).await? {
                if attempt > 0 {
                    tracing::debug!(declared = %safe, resolved = %candidate, "name taken, disambiguated");
                }
                return Ok(candidate);
            }
            attempt += 1;
        }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn store(&self, bytes: Bytes, declared_name: &str, content_type: &str) -> Result<String, FileStoreError> {
        let staging = self.root_path.join(format!(".{}.part", Uuid::new_v4().simple()));

        let written = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(&bytes).await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }

        match self.adopt(&staging, declared_name).await {
            Ok(id) => {
                tracing::info!(id = %id, content_type, length = bytes.len(), "stored file");
                Ok(id)
            }
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    async fn fetch(&self, id: &str) -> Result<StoredFile, FileStoreError> {
        let path = self.file_path(id)?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(FileStoreError::NotFound(id.to_string())),
            Err(e) => return Err(e.into()),
        };
        let modified = fs::metadata(&path).await?.modified()?;
        let content_type = mime_guess::from_path(&path)
            .first_raw()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        Ok(StoredFile {
            id: id.to_string(),
            bytes,
            content_type,
            last_modified: modified.into(),
        })
    }

    async fn delete(&self, id: &str) -> Result<bool, FileStoreError> {
        let path = self.file_path(id)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_metadata(&self) -> Result<Vec<FileMetadata>, FileStoreError> {
        let mut entries = fs::read_dir(&self.root_path).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };

            if !meta.is_file() || name.starts_with('.') {
                continue;
            }

            files.push(FileMetadata {
                id: name.clone(),
                name,
                last_modified: meta.modified()?.into(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn exists(&self, id: &str) -> bool {
        match self.file_path(id) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn adopt(&self, source: &Path, declared_name: &str) -> Result<String, FileStoreError> {
        // Held through the rename so two adopts never resolve the same free name.
        let _naming = self.naming.lock().await;

        let id = self.resolve_name(declared_name).await?;
        fs::rename(source, self.root_path.join(&id)).await?;

        Ok(id)
    }
}
