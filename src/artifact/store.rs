use log::debug;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key {key}: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("object store error on {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: object_store::Error,
    },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("artifact store configuration error: {0}")]
    Config(String),
}

impl ArtifactError {
    fn store(key: &str, source: object_store::Error) -> Self {
        match source {
            object_store::Error::NotFound { .. } => ArtifactError::NotFound(key.to_string()),
            source => ArtifactError::Store {
                key: key.to_string(),
                source,
            },
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Joins a prefix and a relative key with exactly one `/` between them.
pub fn join_key(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    match (prefix.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, rest),
    }
}

/// Key/prefix blob store for run outputs and cached inputs.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<dyn ObjectStore>,
    label: String,
    tag_content_type: bool,
}

impl ArtifactStore {
    /// S3 bucket; credentials and endpoint come from the standard AWS environment.
    pub fn s3(bucket: &str, region: &str) -> Result<Self, ArtifactError> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region)
            .build()
            .map_err(|e| ArtifactError::Config(format!("S3 bucket {}: {}", bucket, e)))?;
        Ok(Self {
            inner: Arc::new(store),
            label: format!("s3://{}", bucket),
            tag_content_type: true,
        })
    }

    /// Directory-backed store, used by `run-local`.
    pub fn local(root: &Path) -> Result<Self, ArtifactError> {
        std::fs::create_dir_all(root).map_err(|e| ArtifactError::io(root, e))?;
        let root = root.canonicalize().map_err(|e| ArtifactError::io(root, e))?;
        let store = LocalFileSystem::new_with_prefix(&root)
            .map_err(|e| ArtifactError::Config(format!("{}: {}", root.display(), e)))?;
        Ok(Self {
            inner: Arc::new(store),
            label: format!("file://{}", root.display()),
            // LocalFileSystem rejects object attributes.
            tag_content_type: false,
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(object_store::memory::InMemory::new()),
            label: "memory://".to_string(),
            tag_content_type: true,
        }
    }

    pub fn location(&self, key: &str) -> String {
        join_key(&self.label, key)
    }

    fn path(key: &str) -> Result<ObjectPath, ArtifactError> {
        ObjectPath::parse(key).map_err(|e| ArtifactError::InvalidKey {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn put_bytes(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ArtifactError> {
        let path = Self::path(key)?;
        let mut opts = PutOptions::default();
        if self.tag_content_type && !content_type.is_empty() {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
            opts.attributes = attributes;
        }
        self.inner
            .put_opts(&path, PutPayload::from(data), opts)
            .await
            .map_err(|e| ArtifactError::store(key, e))?;
        debug!("put {} ({})", self.location(key), content_type);
        Ok(())
    }

    pub async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), ArtifactError> {
        let body = serde_json::to_vec_pretty(value)?;
        self.put_bytes(key, body, "application/json").await
    }

    pub async fn upload_file(
        &self,
        local: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<(), ArtifactError> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| ArtifactError::io(local, e))?;
        self.put_bytes(key, data, content_type).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = Self::path(key)?;
        let result = self
            .inner
            .get(&path)
            .await
            .map_err(|e| ArtifactError::store(key, e))?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| ArtifactError::store(key, e))?;
        Ok(bytes.to_vec())
    }

    /// Like `get`, but a missing object is `None` rather than an error.
    pub async fn get_opt(&self, key: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        match self.get(key).await {
            Ok(data) => Ok(Some(data)),
            Err(ArtifactError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn download_to(&self, key: &str, dest: &Path) -> Result<(), ArtifactError> {
        let data = self.get(key).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ArtifactError::io(parent, e))?;
        }
        tokio::fs::write(dest, data)
            .await
            .map_err(|e| ArtifactError::io(dest, e))
    }

    #[cfg(test)]
    pub async fn head_content_type(&self, key: &str) -> Result<Option<String>, ArtifactError> {
        let path = Self::path(key)?;
        let result = self
            .inner
            .get(&path)
            .await
            .map_err(|e| ArtifactError::store(key, e))?;
        Ok(result
            .attributes
            .get(&Attribute::ContentType)
            .map(|v| v.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_key_normalises_slashes() {
        assert_eq!(join_key("runs/r1/", "metrics.json"), "runs/r1/metrics.json");
        assert_eq!(join_key("runs/r1", "/grid/000"), "runs/r1/grid/000");
        assert_eq!(join_key("", "a/b"), "a/b");
        assert_eq!(join_key("runs/r1/", ""), "runs/r1");
    }

    #[tokio::test]
    async fn memory_store_tags_content_type() {
        let store = ArtifactStore::in_memory();
        store
            .put_json("runs/r1/metrics.json", &json!({"runId": "r1"}))
            .await
            .unwrap();

        let body: serde_json::Value =
            serde_json::from_slice(&store.get("runs/r1/metrics.json").await.unwrap()).unwrap();
        assert_eq!(body["runId"], json!("r1"));
        assert_eq!(
            store.head_content_type("runs/r1/metrics.json").await.unwrap().as_deref(),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn missing_objects() {
        let store = ArtifactStore::in_memory();
        assert!(matches!(store.get("nope").await, Err(ArtifactError::NotFound(_))));
        assert!(store.get_opt("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_store_round_trips_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::local(&dir.path().join("bucket")).unwrap();

        let src = dir.path().join("equity.csv");
        std::fs::write(&src, "t,equity\n0,1000\n").unwrap();
        store.upload_file(&src, "runs/r1/equity.csv", "text/csv").await.unwrap();

        let dest = dir.path().join("copy/equity.csv");
        store.download_to("runs/r1/equity.csv", &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "t,equity\n0,1000\n");
        assert!(dir.path().join("bucket/runs/r1/equity.csv").exists());
    }
}
