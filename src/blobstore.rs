//! Blob storage for uploaded documents.
//!
//! The production deployment points this at an object store; this
//! implementation keeps blobs on the local filesystem and issues signed
//! time-limited PUT URLs served by the API's blob endpoint. Object names
//! follow `uploads/{slot_id}/{sanitized_filename}`.

use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

/// Local-filesystem blob store with presigned-URL semantics.
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
    secret: String,
    public_base: String,
}

impl BlobStore {
    pub fn new(root: PathBuf, secret: String, public_base: String) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            secret,
            public_base,
        })
    }

    /// Allocate an object name for a new upload slot.
    pub fn object_name(slot_id: &str, sanitized_filename: &str) -> String {
        format!("uploads/{slot_id}/{sanitized_filename}")
    }

    fn signature(&self, object_name: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"\0");
        hasher.update(object_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Issue a time-limited PUT URL for an object.
    pub fn presign_put(&self, object_name: &str, ttl_seconds: u64) -> Result<String> {
        validate_object_name(object_name)?;
        let expires = Utc::now().timestamp() + ttl_seconds as i64;
        let sig = self.signature(object_name, expires);
        Ok(format!(
            "{}/api/v1/blobs/{object_name}?expires={expires}&sig={sig}",
            self.public_base.trim_end_matches('/'),
        ))
    }

    /// Verify a presigned PUT request's token.
    pub fn verify_put(&self, object_name: &str, expires: i64, sig: &str) -> Result<()> {
        validate_object_name(object_name)?;
        if Utc::now().timestamp() > expires {
            return Err(PipelineError::Validation("upload URL expired".into()));
        }
        if self.signature(object_name, expires) != sig {
            return Err(PipelineError::Validation("bad upload signature".into()));
        }
        Ok(())
    }

    fn blob_path(&self, object_name: &str) -> Result<PathBuf> {
        validate_object_name(object_name)?;
        Ok(self.root.join(object_name))
    }

    /// Path for writing an incoming object. Parent directories are
    /// created; the caller streams into the returned path.
    pub fn prepare_write(&self, object_name: &str) -> Result<PathBuf> {
        let path = self.blob_path(object_name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Resolve an object to a local path for pipeline consumption.
    pub fn download(&self, object_name: &str) -> Result<PathBuf> {
        let path = self.blob_path(object_name)?;
        if !path.exists() {
            return Err(PipelineError::NotFound(format!("blob {object_name}")));
        }
        Ok(path)
    }

    pub fn exists(&self, object_name: &str) -> bool {
        self.blob_path(object_name)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Remove an object. Missing objects are fine (retention may have
    /// beaten us to it).
    pub fn delete(&self, object_name: &str) -> Result<()> {
        let path = self.blob_path(object_name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the backing directory is writable, for health checks.
    pub fn healthy(&self) -> bool {
        self.root.is_dir()
    }
}

/// Object names are relative, slash-separated, and free of traversal.
fn validate_object_name(object_name: &str) -> Result<()> {
    let ok = !object_name.is_empty()
        && !object_name.starts_with('/')
        && !object_name.contains('\\')
        && !object_name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if ok {
        Ok(())
    } else {
        Err(PipelineError::Validation(format!(
            "bad object name: {object_name:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (BlobStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(
            dir.path().join("blobs"),
            "secret".into(),
            "http://localhost:8000".into(),
        )
        .unwrap();
        (store, dir)
    }

    #[test]
    fn test_presign_and_verify() {
        let (store, _dir) = store();
        let url = store.presign_put("uploads/slot/roof.pdf", 900).unwrap();
        assert!(url.contains("/api/v1/blobs/uploads/slot/roof.pdf?"));

        let query = url.split('?').nth(1).unwrap();
        let mut expires = 0i64;
        let mut sig = String::new();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "expires" => expires = v.parse().unwrap(),
                "sig" => sig = v.to_string(),
                _ => {}
            }
        }
        assert!(store.verify_put("uploads/slot/roof.pdf", expires, &sig).is_ok());
        assert!(store.verify_put("uploads/slot/other.pdf", expires, &sig).is_err());
        assert!(store.verify_put("uploads/slot/roof.pdf", expires, "forged").is_err());
    }

    #[test]
    fn test_expired_url_rejected() {
        let (store, _dir) = store();
        let expires = Utc::now().timestamp() - 10;
        let sig = store.signature("uploads/slot/roof.pdf", expires);
        assert!(store
            .verify_put("uploads/slot/roof.pdf", expires, &sig)
            .is_err());
    }

    #[test]
    fn test_write_download_delete_round_trip() {
        let (store, _dir) = store();
        let name = "uploads/slot/roof.pdf";
        let path = store.prepare_write(name).unwrap();
        std::fs::write(&path, b"%PDF-").unwrap();

        assert!(store.exists(name));
        let resolved = store.download(name).unwrap();
        assert_eq!(std::fs::read(resolved).unwrap(), b"%PDF-");

        store.delete(name).unwrap();
        assert!(!store.exists(name));
        // Deleting again is not an error.
        store.delete(name).unwrap();
    }

    #[test]
    fn test_traversal_names_rejected() {
        let (store, _dir) = store();
        assert!(store.download("../etc/passwd").is_err());
        assert!(store.download("/abs/path").is_err());
        assert!(store.download("uploads//x").is_err());
        assert!(store.presign_put("uploads/./x", 900).is_err());
    }
}
