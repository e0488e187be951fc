//! Local filesystem backend, rooted at a directory. Connection paths are relative to the root.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;

use anyhow::{Context, bail};
use async_recursion::async_recursion;
use remote::cancel::CancelScope;
use remote::streams::Writer;
use remote::tarstream::{EntryMeta, TarSource};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::backend::{self, FileShare};
use crate::connection::{Connection, FILE_SCHEME, FileCopyOpts, FileInfo};
use crate::copy::PolicyError;

#[derive(Debug, Clone)]
pub struct LocalFs {
    root: std::path::PathBuf,
}

fn entry_meta(metadata: &std::fs::Metadata) -> EntryMeta {
    EntryMeta {
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        is_dir: metadata.is_dir(),
        mode: metadata.permissions().mode(),
        mtime: u64::try_from(metadata.mtime()).unwrap_or_default(),
    }
}

impl LocalFs {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn key(path: &str) -> anyhow::Result<String> {
        common::path::clean_path_prefix(path).with_context(|| format!("invalid path {path:?}"))
    }

    fn fs_path(&self, key: &str) -> std::path::PathBuf {
        if key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(key)
        }
    }

    #[async_recursion]
    async fn write_tree(&self, source: &mut TarSource, key: &str) -> anyhow::Result<()> {
        let path = self.fs_path(key);
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", &path))?;
        if metadata.is_file() {
            source.write_header(&entry_meta(&metadata), key).await?;
            let mut file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("cannot open {:?} for reading", &path))?;
            source
                .copy_content(&mut file)
                .await
                .with_context(|| format!("failed reading {:?}", &path))?;
            return Ok(());
        }
        if !metadata.is_dir() {
            tracing::warn!("skipping {:?}: not a regular file or directory", &path);
            return Ok(());
        }
        source.write_header(&entry_meta(&metadata), key).await?;
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", &path))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", &path))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        for name in names {
            self.write_tree(source, &common::path::join(key, &name))
                .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileShare for LocalFs {
    fn connection_type(&self) -> &str {
        FILE_SCHEME
    }

    async fn stat(&self, conn: &Connection) -> anyhow::Result<FileInfo> {
        let key = Self::key(&conn.path)?;
        let path = self.fs_path(&key);
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FileInfo::not_found(&key));
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed reading metadata from {path:?}"));
            }
        };
        let meta = entry_meta(&metadata);
        Ok(FileInfo {
            name: common::path::base(&key).to_string(),
            path: key,
            size: meta.size,
            mode: meta.mode,
            mtime: meta.mtime,
            is_dir: meta.is_dir,
            not_found: false,
        })
    }

    async fn delete(&self, conn: &Connection, recursive: bool) -> anyhow::Result<usize> {
        let key = Self::key(&conn.path)?;
        let path = self.fs_path(&key);
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .with_context(|| format!("failed reading metadata from {path:?}"))?;
        if metadata.is_dir() && !recursive {
            return Err(PolicyError::RecursiveRequired.into());
        }
        let summary = common::rm::rm(&path).await?;
        tracing::debug!("removed {:?}: {}", path, summary);
        Ok(summary.entries_removed())
    }

    async fn list_entries_prefix(&self, _host: &str, prefix: &str) -> anyhow::Result<Vec<String>> {
        let dir_key = Self::key(prefix)?;
        let mut keys = Vec::new();
        let mut pending = vec![dir_key];
        while let Some(dir_key) = pending.pop() {
            let dir = self.fs_path(&dir_key);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("cannot open directory {dir:?} for reading"));
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("failed traversing directory {dir:?}"))?
            {
                let key = common::path::join(&dir_key, &entry.file_name().to_string_lossy());
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(key);
                } else if file_type.is_file() {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn read_tar_stream(
        &self,
        conn: &Connection,
        opts: &FileCopyOpts,
        writer: Arc<Writer>,
        scope: CancelScope,
    ) -> anyhow::Result<()> {
        let info = self.stat(conn).await?;
        if info.not_found {
            bail!("file not found: {}", conn);
        }
        if info.is_dir && !opts.recursive {
            return Err(PolicyError::RecursiveRequired.into());
        }
        let prefix = if info.is_dir {
            info.path.as_str()
        } else {
            common::path::parent(&info.path)
        };
        let mut source = TarSource::new(writer, prefix, scope);
        let result = self.write_tree(&mut source, &info.path).await;
        backend::finish_tar_source(source, result).await
    }

    async fn put_file(
        &self,
        _host: &str,
        path: &str,
        size: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<u64> {
        let key = Self::key(path)?;
        if key.is_empty() {
            bail!("cannot write a file at the root {:?}", self.root);
        }
        let path = self.fs_path(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {parent:?}"))?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("cannot open {path:?} for writing"))?;
        let written = tokio::io::copy(reader, &mut file)
            .await
            .with_context(|| format!("failed writing {path:?}"))?;
        file.flush()
            .await
            .with_context(|| format!("failed writing {path:?}"))?;
        if written != size {
            bail!(
                "size mismatch for {:?}: expected {} bytes, got {}",
                path,
                size,
                written
            );
        }
        Ok(written)
    }

    async fn copy_file_internal(&self, _host: &str, src: &str, dest: &str) -> anyhow::Result<u64> {
        let src = self.fs_path(&Self::key(src)?);
        let dest = self.fs_path(&Self::key(dest)?);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {parent:?}"))?;
        }
        tokio::fs::copy(&src, &dest)
            .await
            .with_context(|| format!("failed copying {src:?} to {dest:?}"))
    }
}
