//! Directory-backed upload storage.
//!
//! `PUT`/`POST` requests under the upload prefix are written to a temp file
//! beside their destination and persisted atomically once the body is
//! complete.

use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

use super::server::{StoredUpload, UploadSink, UploadStore};
use super::RequestHead;

pub struct DirectoryStore {
    root: PathBuf,
    prefix: String,
}

impl DirectoryStore {
    /// Serve uploads under `/upload/` into `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_prefix(root, "/upload/")
    }

    pub fn with_prefix(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        DirectoryStore {
            root: root.into(),
            prefix: prefix.into(),
        }
    }
}

/// Join `rel` under `root`, refusing anything that could escape it:
/// NUL bytes, `..`, absolute and prefix components.
pub(crate) fn resolve_under_root(root: &Path, rel: &str) -> io::Result<PathBuf> {
    let invalid = |why: &str| io::Error::new(io::ErrorKind::InvalidInput, format!("{why}: {rel:?}"));

    if rel.contains('\0') {
        return Err(invalid("path contains NUL byte"));
    }
    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path contains disallowed component"));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(invalid("empty upload path"));
    }
    Ok(root.join(safe))
}

impl UploadStore for DirectoryStore {
    fn begin(&self, head: &RequestHead) -> io::Result<Option<Box<dyn UploadSink>>> {
        if head.method != "PUT" && head.method != "POST" {
            return Ok(None);
        }
        let Some(rel) = head.path.strip_prefix(self.prefix.as_str()) else {
            return Ok(None);
        };
        let rel = rel.split('?').next().unwrap_or_default();
        let target = resolve_under_root(&self.root, rel)?;
        let dir = target.parent().unwrap_or(&self.root).to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let tmp = NamedTempFile::new_in(&dir)?;
        tracing::debug!(target = %target.display(), "upload started");
        Ok(Some(Box::new(FileSink {
            tmp,
            target,
            location: rel.to_string(),
            bytes: 0,
        })))
    }
}

struct FileSink {
    tmp: NamedTempFile,
    target: PathBuf,
    location: String,
    bytes: u64,
}

impl UploadSink for FileSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.tmp.write_all(chunk)?;
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> io::Result<StoredUpload> {
        self.tmp.flush()?;
        let FileSink {
            tmp,
            target,
            location,
            bytes,
        } = *self;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(StoredUpload { location, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;

    fn head(method: &str, path: &str) -> RequestHead {
        RequestHead {
            method: method.into(),
            path: path.into(),
            version: "HTTP/1.1".into(),
            headers: Headers::new(),
        }
    }

    #[test]
    fn test_resolve_under_root_safe_paths() {
        let root = Path::new("/srv/uploads");
        assert_eq!(
            resolve_under_root(root, "dir/file.txt").unwrap(),
            root.join("dir/file.txt")
        );
        assert_eq!(
            resolve_under_root(root, "./dir/./file.txt").unwrap(),
            root.join("dir/file.txt")
        );
    }

    #[test]
    fn test_resolve_under_root_unsafe_paths() {
        let root = Path::new("/srv/uploads");
        for bad in ["../etc/passwd", "a/../../b", "/etc/passwd", "file\0.txt", "", "."] {
            let err = resolve_under_root(root, bad).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{bad:?}");
        }
    }

    #[test]
    fn test_store_ignores_other_routes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        assert!(store.begin(&head("GET", "/upload/a.txt")).unwrap().is_none());
        assert!(store.begin(&head("PUT", "/other/a.txt")).unwrap().is_none());
    }

    #[test]
    fn test_sink_persists_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let mut sink = store
            .begin(&head("PUT", "/upload/nested/data.bin"))
            .unwrap()
            .unwrap();
        sink.write_chunk(b"abc").unwrap();
        sink.write_chunk(b"def").unwrap();
        assert!(!dir.path().join("nested/data.bin").exists());
        let stored = sink.finish().unwrap();
        assert_eq!(stored.bytes, 6);
        assert_eq!(stored.location, "nested/data.bin");
        assert_eq!(
            std::fs::read(dir.path().join("nested/data.bin")).unwrap(),
            b"abcdef"
        );
    }
}
