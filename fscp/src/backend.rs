//! The capabilities a storage backend provides to the copy engine.

use std::sync::Arc;

use remote::cancel::CancelScope;
use remote::streams::Writer;
use remote::tarstream::TarSource;
use tokio::io::AsyncRead;

use crate::connection::{Connection, FileCopyOpts, FileInfo};
use crate::copy;

/// A storage backend: a local filesystem, a remote host or a flat prefix store.
///
/// Paths passed as `&str` are storage keys relative to the host, as produced by
/// [`common::path::clean_path_prefix`].
#[async_trait::async_trait]
pub trait FileShare: Send + Sync + std::fmt::Debug {
    /// Scheme this backend serves.
    fn connection_type(&self) -> &str;

    async fn stat(&self, conn: &Connection) -> anyhow::Result<FileInfo>;

    /// Deletes the file or directory at `conn`; returns the number of entries removed.
    async fn delete(&self, conn: &Connection, recursive: bool) -> anyhow::Result<usize>;

    /// Keys of all files below `prefix`, each starting with `prefix`.
    async fn list_entries_prefix(&self, host: &str, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Encodes the file or directory at `conn` as a tar archive into `writer`.
    ///
    /// Entry names are relative to the directory being read (the directory itself is `.`), or the
    /// base name for a single file. Canceling `scope` stops the producer.
    async fn read_tar_stream(
        &self,
        conn: &Connection,
        opts: &FileCopyOpts,
        writer: Arc<Writer>,
        scope: CancelScope,
    ) -> anyhow::Result<()>;

    /// Writes a file of `size` bytes from `reader`, creating missing parents; returns the number of
    /// bytes written.
    async fn put_file(
        &self,
        host: &str,
        path: &str,
        size: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<u64>;

    /// Copies a single file within `host`; returns the number of bytes copied.
    async fn copy_file_internal(&self, host: &str, src: &str, dest: &str) -> anyhow::Result<u64>;

    /// Copies within this backend, by default one key at a time.
    async fn copy_internal(
        &self,
        src: &Connection,
        dest: &Connection,
        opts: &FileCopyOpts,
    ) -> Result<copy::Summary, copy::Error> {
        copy::prefix_copy_internal(self, src, dest, opts).await
    }
}

/// Finishes the archive written by a producer: closes `source` on success, otherwise terminates
/// the stream with the producer's error.
pub async fn finish_tar_source(
    source: TarSource,
    result: anyhow::Result<()>,
) -> anyhow::Result<()> {
    match result {
        Ok(()) => source.close().await,
        Err(error) => {
            source.abort(&error).await;
            Err(error)
        }
    }
}
