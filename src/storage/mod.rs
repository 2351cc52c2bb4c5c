//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Uniform async file operations over the local filesystem and object
//! stores (S3, GCS, ABFS).
//!
//! All paths are plain strings: filesystem paths for the local backend,
//! full URIs (`s3://bucket/key`) for object backends. Directories only
//! exist implicitly on object stores, so `makedirs` is a no-op there and
//! `isdir` means "some object lives below this prefix".

mod workspace;
pub use workspace::*;

use std::path::Path as FsPath;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Error;
use anyhow::Result;
use futures::StreamExt;
use log::trace;
use object_store::path::Path as ObjectPath;
use object_store::DynObjectStore;
use url::Url;

/// Join path segments with a single `/`, stripping duplicate separators.
pub fn join(base: &str, parts: &[&str]) -> String {
    let mut out = base.trim_end_matches('/').to_string();
    for part in parts {
        let part = part.trim_matches('/');
        if !part.is_empty() {
            out.push('/');
            out.push_str(part);
        }
    }
    out
}

/// The final path segment, with any trailing separator removed.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
}

/// The parent of the final path segment.
pub fn parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

#[derive(Clone)]
enum Backend {
    Local,
    Object {
        store: Arc<DynObjectStore>,
        /// `scheme://authority` prefix that all paths handed to this
        /// storage are expected to carry
        base: String,
    },
}

/// Handle for file operations below one storage root.
#[derive(Clone)]
pub struct Storage {
    backend: Backend,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backend {
            Backend::Local => write!(f, "Storage(local)"),
            Backend::Object { base, .. } => write!(f, "Storage({})", base),
        }
    }
}

impl Storage {
    /// Build a storage handle for the given root. Roots carrying a URL
    /// scheme are served by the matching object store; everything else is
    /// treated as a local filesystem path.
    pub fn for_root(root: &str) -> Result<Self> {
        if root.contains("://") {
            let url = Url::parse(root)
                .with_context(|| anyhow!("Parsing storage root as URL: {}", root))?;
            let (store, _) = object_store::parse_url(&url)
                .with_context(|| anyhow!("Constructing object store for {}", root))?;
            let base = format!(
                "{}://{}",
                url.scheme(),
                url.host_str().unwrap_or_default()
            );
            Ok(Storage {
                backend: Backend::Object {
                    store: Arc::from(store),
                    base,
                },
            })
        } else {
            Ok(Storage {
                backend: Backend::Local,
            })
        }
    }

    fn object_path(&self, path: &str) -> Result<ObjectPath> {
        match &self.backend {
            Backend::Local => Err(anyhow!("Not an object storage path: {}", path)),
            Backend::Object { base, .. } => {
                let rel = path
                    .strip_prefix(base.as_str())
                    .ok_or_else(|| anyhow!("Path {} is outside of storage root {}", path, base))?
                    .trim_start_matches('/');
                Ok(ObjectPath::from(rel))
            }
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match &self.backend {
            Backend::Local => Ok(tokio::fs::try_exists(path).await.unwrap_or(false)),
            Backend::Object { .. } => {
                Ok(self.isfile(path).await? || self.isdir(path).await?)
            }
        }
    }

    pub async fn isdir(&self, path: &str) -> Result<bool> {
        match &self.backend {
            Backend::Local => Ok(tokio::fs::metadata(path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)),
            Backend::Object { store, .. } => {
                let prefix = self.object_path(path)?;
                let mut stream = store.list(Some(&prefix));
                Ok(stream.next().await.transpose().unwrap_or(None).is_some())
            }
        }
    }

    pub async fn isfile(&self, path: &str) -> Result<bool> {
        match &self.backend {
            Backend::Local => Ok(tokio::fs::metadata(path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)),
            Backend::Object { store, .. } => {
                let loc = self.object_path(path)?;
                Ok(store.head(&loc).await.is_ok())
            }
        }
    }

    /// List the immediate children of a directory, as full paths.
    /// Missing directories list as empty.
    pub async fn ls(&self, path: &str) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Local => {
                let mut entries = Vec::new();
                let mut dir = match tokio::fs::read_dir(path).await {
                    Ok(d) => d,
                    Err(_) => return Ok(entries),
                };
                while let Some(entry) = dir.next_entry().await? {
                    entries.push(entry.path().to_string_lossy().to_string());
                }
                entries.sort();
                Ok(entries)
            }
            Backend::Object { store, base } => {
                let prefix = self.object_path(path)?;
                let listing = store
                    .list_with_delimiter(Some(&prefix))
                    .await
                    .with_context(|| anyhow!("Listing {}", path))?;
                let mut entries = Vec::new();
                for p in listing.common_prefixes {
                    entries.push(format!("{}/{}", base, p.as_ref()));
                }
                for meta in listing.objects {
                    entries.push(format!("{}/{}", base, meta.location.as_ref()));
                }
                entries.sort();
                Ok(entries)
            }
        }
    }

    /// Recursively list all files below a path.
    pub async fn find(&self, path: &str) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Local => {
                let mut found = Vec::new();
                let mut stack = vec![path.to_string()];
                while let Some(current) = stack.pop() {
                    let mut dir = match tokio::fs::read_dir(&current).await {
                        Ok(d) => d,
                        Err(_) => continue,
                    };
                    while let Some(entry) = dir.next_entry().await? {
                        let p = entry.path().to_string_lossy().to_string();
                        if entry.file_type().await?.is_dir() {
                            stack.push(p);
                        } else {
                            found.push(p);
                        }
                    }
                }
                found.sort();
                Ok(found)
            }
            Backend::Object { store, base } => {
                let prefix = self.object_path(path)?;
                let mut stream = store.list(Some(&prefix));
                let mut found = Vec::new();
                while let Some(meta) = stream.next().await {
                    let meta = meta.with_context(|| anyhow!("Listing below {}", path))?;
                    found.push(format!("{}/{}", base, meta.location.as_ref()));
                }
                found.sort();
                Ok(found)
            }
        }
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        match &self.backend {
            Backend::Local => tokio::fs::read(path)
                .await
                .with_context(|| anyhow!("Reading file {}", path))
                .map_err(Error::from),
            Backend::Object { store, .. } => {
                let loc = self.object_path(path)?;
                let result = store
                    .get(&loc)
                    .await
                    .with_context(|| anyhow!("Reading object {}", path))?;
                Ok(result
                    .bytes()
                    .await
                    .with_context(|| anyhow!("Downloading object {}", path))?
                    .to_vec())
            }
        }
    }

    pub async fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).with_context(|| anyhow!("File {} is not valid UTF-8", path))
    }

    /// Write a file whole. On the local backend the write goes through a
    /// temporary sibling plus rename so readers never observe a torn
    /// document; object store puts are already atomic.
    pub async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        match &self.backend {
            Backend::Local => {
                if let Some(parent) = FsPath::new(path).parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| anyhow!("Creating directory {}", parent.display()))?;
                }
                let tmp = format!("{}.tmp", path);
                tokio::fs::write(&tmp, data)
                    .await
                    .with_context(|| anyhow!("Writing file {}", tmp))?;
                tokio::fs::rename(&tmp, path)
                    .await
                    .with_context(|| anyhow!("Renaming {} to {}", tmp, path))?;
                Ok(())
            }
            Backend::Object { store, .. } => {
                let loc = self.object_path(path)?;
                store
                    .put(&loc, bytes::Bytes::from(data.to_vec()))
                    .await
                    .with_context(|| anyhow!("Writing object {}", path))?;
                Ok(())
            }
        }
    }

    pub async fn makedirs(&self, path: &str) -> Result<()> {
        match &self.backend {
            Backend::Local => tokio::fs::create_dir_all(path)
                .await
                .with_context(|| anyhow!("Creating directory {}", path))
                .map_err(Error::from),
            Backend::Object { .. } => Ok(()),
        }
    }

    /// Remove a single file; removing a missing file is not an error.
    pub async fn rm(&self, path: &str) -> Result<()> {
        match &self.backend {
            Backend::Local => match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::from(e)).with_context(|| anyhow!("Removing file {}", path)),
            },
            Backend::Object { store, .. } => {
                let loc = self.object_path(path)?;
                match store.delete(&loc).await {
                    Ok(()) => Ok(()),
                    Err(object_store::Error::NotFound { .. }) => Ok(()),
                    Err(e) => {
                        Err(Error::from(e)).with_context(|| anyhow!("Removing object {}", path))
                    }
                }
            }
        }
    }

    /// Remove a directory tree (or object prefix) recursively.
    pub async fn rm_tree(&self, path: &str) -> Result<()> {
        match &self.backend {
            Backend::Local => match tokio::fs::remove_dir_all(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::from(e)).with_context(|| anyhow!("Removing tree {}", path)),
            },
            Backend::Object { .. } => {
                for file in self.find(path).await? {
                    self.rm(&file).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn copy_file(&self, src: &str, dest: &str) -> Result<()> {
        trace!("Copying {} -> {}", src, dest);
        let data = self.read(src).await?;
        self.write(dest, &data).await
    }

    pub async fn copy_dir(&self, src: &str, dest: &str) -> Result<()> {
        let src_root = src.trim_end_matches('/');
        for file in self.find(src_root).await? {
            let rel = file
                .strip_prefix(src_root)
                .ok_or_else(|| anyhow!("File {} escapes source dir {}", file, src_root))?
                .trim_start_matches('/');
            let target = join(dest, &[rel]);
            self.copy_file(&file, &target).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_separators() {
        assert_eq!(join("/a/b/", &["c", "d"]), "/a/b/c/d");
        assert_eq!(join("s3://bucket", &["k"]), "s3://bucket/k");
        assert_eq!(join("/a", &[""]), "/a");
    }

    #[test]
    fn file_name_takes_last_segment() {
        assert_eq!(file_name("/a/b/c"), "c");
        assert_eq!(file_name("/a/b/c/"), "c");
        assert_eq!(file_name("c"), "c");
    }

    #[test]
    fn parent_strips_last_segment() {
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(parent("/a/b/c/"), "/a/b");
    }

    #[tokio::test]
    async fn local_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::for_root(tmp.path().to_str().unwrap()).unwrap();
        let file = join(tmp.path().to_str().unwrap(), &["sub", "f.json"]);

        assert!(!storage.exists(&file).await.unwrap());
        storage.write(&file, b"{}").await.unwrap();
        assert!(storage.isfile(&file).await.unwrap());
        assert_eq!(storage.read_to_string(&file).await.unwrap(), "{}");

        let found = storage.find(tmp.path().to_str().unwrap()).await.unwrap();
        assert_eq!(found, vec![file.clone()]);

        storage.rm(&file).await.unwrap();
        assert!(!storage.exists(&file).await.unwrap());
        // deleting again stays quiet
        storage.rm(&file).await.unwrap();
    }

    #[tokio::test]
    async fn copy_dir_preserves_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();
        let storage = Storage::for_root(root).unwrap();

        storage.write(&join(root, &["src", "a.txt"]), b"a").await.unwrap();
        storage
            .write(&join(root, &["src", "sub", "b.txt"]), b"b")
            .await
            .unwrap();

        storage
            .copy_dir(&join(root, &["src"]), &join(root, &["dst"]))
            .await
            .unwrap();

        assert!(storage.isfile(&join(root, &["dst", "a.txt"])).await.unwrap());
        assert!(storage
            .isfile(&join(root, &["dst", "sub", "b.txt"]))
            .await
            .unwrap());
    }
}
