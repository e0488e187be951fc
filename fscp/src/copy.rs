//! Copies and moves between and within storage backends.
//!
//! Destination resolution follows rsync: copying `src` into an existing directory `dst` creates
//! `dst/src`, while `src/` copies the contents of `src`. Within one backend the copy goes key by
//! key; between backends the source is streamed as a tar archive through a flow-controlled stream
//! and written to the destination entry by entry.

use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use remote::broker::Broker;
use remote::cancel::CancelScope;
use remote::tarstream::{EntryHandler, EntryHeader};
use tokio::io::AsyncRead;
use tracing::instrument;

use crate::backend::FileShare;
use crate::connection::{Connection, FileCopyOpts, FileInfo};

/// Copy requests that are refused before or instead of touching any data.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("cannot specify both overwrite and merge")]
    OverwriteAndMerge,
    #[error("recursive flag must be set for directory operations")]
    RecursiveRequired,
    #[error("source file not found: {0}")]
    SourceNotFound(String),
    #[error(
        "directory already exists at {0:?}, set overwrite flag to delete the existing contents or set merge flag to merge the contents"
    )]
    MergeRequired(String),
    #[error("file already exists at {0:?}, set overwrite flag to delete the existing file")]
    OverwriteRequired(String),
}

/// Error type for copy operations that preserves the work done before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }

    /// The policy violation behind this error, if that is what stopped the copy.
    pub fn policy(&self) -> Option<&PolicyError> {
        self.source.downcast_ref::<PolicyError>()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub files_copied: usize,
    pub bytes_copied: u64,
    pub entries_deleted: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_copied: self.files_copied + other.files_copied,
            bytes_copied: self.bytes_copied + other.bytes_copied,
            entries_deleted: self.entries_deleted + other.entries_deleted,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            entries deleted: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.entries_deleted
        )
    }
}

/// Where a copy reads from and writes to, once the destination conflicts have been dealt with.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub src_path: String,
    /// Cleaned destination key the source itself maps to.
    pub dest_path: String,
    pub src_info: FileInfo,
    /// Entries removed from a conflicting destination.
    pub deleted: usize,
}

/// Resolves the destination of copying `src_conn` to `dest_conn`.
///
/// Without a trailing slash on the source, the source base name is appended when the destination
/// is an existing directory, or when it does not exist, has no trailing slash and the source is a
/// directory. An existing final destination is deleted with `overwrite`, merged into with `merge`
/// (directories only) and refused otherwise.
pub async fn determine_copy_dest_path<S, D>(
    src_conn: &Connection,
    dest_conn: &Connection,
    src_client: &S,
    dest_client: &D,
    opts: &FileCopyOpts,
) -> anyhow::Result<Resolved>
where
    S: FileShare + ?Sized,
    D: FileShare + ?Sized,
{
    if opts.overwrite && opts.merge {
        return Err(PolicyError::OverwriteAndMerge.into());
    }
    let src_has_slash = src_conn.has_trailing_slash();
    let dest_has_slash = dest_conn.has_trailing_slash();
    let original_dest_path = common::path::clean_path_prefix(&dest_conn.path)
        .context("error cleaning destination path")?;
    let src_info = src_client
        .stat(src_conn)
        .await
        .with_context(|| format!("error getting source file info for {src_conn}"))?;
    if src_info.not_found {
        return Err(PolicyError::SourceNotFound(src_conn.to_string()).into());
    }
    if src_info.is_dir && !opts.recursive {
        return Err(PolicyError::RecursiveRequired.into());
    }
    let mut dest = dest_conn.with_path(&original_dest_path);
    let mut dest_info = dest_client
        .stat(&dest)
        .await
        .with_context(|| format!("error getting destination file info for {dest}"))?;
    let dest_exists = !dest_info.not_found;
    if !src_has_slash
        && ((dest_exists && dest_info.is_dir)
            || (!dest_exists && !dest_has_slash && src_info.is_dir))
    {
        dest.path = common::path::join(&original_dest_path, common::path::base(&src_conn.path));
    }
    if dest.path != original_dest_path {
        dest_info = dest_client
            .stat(&dest)
            .await
            .with_context(|| format!("error getting destination file info for {dest}"))?;
    }
    if src_conn.same_host(&dest)
        && common::path::clean_path_prefix(&src_conn.path).is_ok_and(|src| src == dest.path)
    {
        bail!("source and destination are the same: {}", dest);
    }
    let mut deleted = 0;
    if !dest_info.not_found {
        if opts.overwrite {
            tracing::info!("deleting existing {}", dest);
            deleted = dest_client
                .delete(&dest, dest_info.is_dir && opts.recursive)
                .await
                .with_context(|| format!("error deleting conflicting destination {dest}"))?;
        } else if dest_info.is_dir && src_info.is_dir {
            if !opts.merge {
                return Err(PolicyError::MergeRequired(dest.to_string()).into());
            }
        } else {
            return Err(PolicyError::OverwriteRequired(dest.to_string()).into());
        }
    }
    tracing::debug!("resolved {} -> {}", src_conn, dest);
    Ok(Resolved {
        src_path: src_conn.path.clone(),
        dest_path: dest.path,
        src_info,
        deleted,
    })
}

// Prefix under which the keys of directory `key` are listed.
fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}{}", common::path::SEPARATOR)
    }
}

/// Copies within one backend, one key at a time.
///
/// A directory source is listed, rebuilt as a [`common::pathtree::Tree`] and every leaf is copied
/// with [`FileShare::copy_file_internal`] to the same relative key below the destination.
#[instrument(skip(client))]
pub async fn prefix_copy_internal<B: FileShare + ?Sized>(
    client: &B,
    src_conn: &Connection,
    dest_conn: &Connection,
    opts: &FileCopyOpts,
) -> Result<Summary, Error> {
    let resolved = determine_copy_dest_path(src_conn, dest_conn, client, client, opts)
        .await
        .map_err(|err| Error::new(err, Summary::default()))?;
    let mut summary = Summary {
        entries_deleted: resolved.deleted,
        ..Default::default()
    };
    let src_key = common::path::clean_path_prefix(&resolved.src_path)
        .context("error cleaning source path")
        .map_err(|err| Error::new(err, summary))?;
    if !resolved.src_info.is_dir {
        let bytes = client
            .copy_file_internal(&src_conn.host, &src_key, &resolved.dest_path)
            .await
            .with_context(|| format!("failed copying {src_key:?} to {:?}", resolved.dest_path))
            .map_err(|err| Error::new(err, summary))?;
        summary.files_copied += 1;
        summary.bytes_copied += bytes;
        return Ok(summary);
    }
    let src_prefix = dir_prefix(&src_key);
    tracing::info!("copying directory {:?} -> {:?}", src_prefix, resolved.dest_path);
    let entries = client
        .list_entries_prefix(&src_conn.host, &src_prefix)
        .await
        .context("error listing source directory")
        .map_err(|err| Error::new(err, summary))?;
    let mut tree = common::pathtree::Tree::new(&src_prefix, "/");
    for entry in &entries {
        tree.add(entry);
    }
    // objects are the leaves, inner nodes only exist as key prefixes
    let mut leaves = Vec::new();
    tree.walk(|path, children| {
        if children == 0 {
            leaves.push(path.to_string());
        }
        Ok::<(), anyhow::Error>(())
    })
    .map_err(|err| Error::new(err, summary))?;
    for leaf in leaves {
        let relative = leaf.strip_prefix(src_prefix.as_str()).unwrap_or(&leaf);
        let dest_key = common::path::join(&resolved.dest_path, relative);
        tracing::debug!("copy {:?} -> {:?}", leaf, dest_key);
        match client
            .copy_file_internal(&src_conn.host, &leaf, &dest_key)
            .await
        {
            Ok(bytes) => {
                summary.files_copied += 1;
                summary.bytes_copied += bytes;
            }
            Err(error) => {
                return Err(Error::new(
                    error.context(format!("failed copying {leaf:?} to {dest_key:?}")),
                    summary,
                ));
            }
        }
    }
    Ok(summary)
}

// Writes the regular files of a tar stream to the destination backend.
struct PutFileHandler<'a, D: ?Sized> {
    dest_client: &'a D,
    host: &'a str,
    dest_path: &'a str,
    src_is_dir: bool,
    // decided by the first entry: a stream starting with a regular file carries a single file
    single_file: Option<bool>,
    summary: Summary,
}

#[async_trait::async_trait]
impl<D: FileShare + ?Sized> EntryHandler for PutFileHandler<'_, D> {
    async fn handle_entry(
        &mut self,
        header: &EntryHeader,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<()> {
        let single_file = *self.single_file.get_or_insert(!header.is_dir);
        if header.is_dir {
            return Ok(());
        }
        if single_file && self.src_is_dir {
            bail!("protocol error: source is a directory, but only a single file is being copied");
        }
        let file_name = if single_file {
            self.dest_path.to_string()
        } else {
            let name = remote::tarstream::entry_name(&header.name, "")
                .context("error cleaning path")?;
            common::path::join(self.dest_path, &name)
        };
        tracing::debug!("writing file {:?} ({} bytes)", file_name, header.size);
        let written = self
            .dest_client
            .put_file(self.host, &file_name, header.size, content)
            .await
            .with_context(|| format!("failed writing {file_name:?}"))?;
        self.summary.files_copied += 1;
        self.summary.bytes_copied += written;
        Ok(())
    }
}

/// Copies between two backends by streaming the source as a tar archive.
///
/// Both ends share one [`CancelScope`]: a failure on either side stops the other one. With
/// `opts.timeout` set, the whole transfer is canceled once it runs out.
#[instrument(skip(broker, src_client, dest_client))]
pub async fn prefix_copy_remote<S, D>(
    broker: &Broker,
    window: u64,
    src_client: &S,
    dest_client: &D,
    src_conn: &Connection,
    dest_conn: &Connection,
    opts: &FileCopyOpts,
) -> Result<Summary, Error>
where
    S: FileShare + ?Sized,
    D: FileShare + ?Sized,
{
    let resolved = determine_copy_dest_path(src_conn, dest_conn, src_client, dest_client, opts)
        .await
        .map_err(|err| Error::new(err, Summary::default()))?;
    let deleted = Summary {
        entries_deleted: resolved.deleted,
        ..Default::default()
    };
    let scope = CancelScope::new();
    let (reader, meta) = broker.create_reader(window);
    let writer = match broker.create_writer(&meta) {
        Ok(writer) => writer,
        Err(error) => {
            reader.close();
            return Err(Error::new(error, deleted));
        }
    };
    tracing::info!("streaming {} -> {} (stream {})", src_conn, dest_conn, meta.id);
    let mut handler = PutFileHandler {
        dest_client,
        host: &dest_conn.host,
        dest_path: &resolved.dest_path,
        src_is_dir: resolved.src_info.is_dir,
        single_file: None,
        summary: Summary::default(),
    };
    let producer = async {
        let result = src_client
            .read_tar_stream(src_conn, opts, writer, scope.clone())
            .await
            .with_context(|| format!("failed reading {src_conn}"));
        if let Err(error) = &result {
            scope.cancel(error);
        }
        result
    };
    let consumer = remote::tarstream::tar_copy_dest(reader.clone(), scope.clone(), &mut handler);
    let transfer = async { tokio::join!(producer, consumer) };
    let outcome = match opts.timeout {
        Some(timeout) => tokio::time::timeout(timeout, transfer).await.map_err(|_| {
            anyhow!(
                "copy of {} timed out after {}",
                src_conn,
                humantime::format_duration(timeout)
            )
        }),
        None => Ok(transfer.await),
    };
    let summary = deleted + handler.summary;
    match outcome {
        Ok((_, Err(error)) | (Err(error), Ok(()))) => Err(Error::new(error, summary)),
        Ok((Ok(()), Ok(()))) => Ok(summary),
        Err(error) => {
            scope.cancel(&error);
            reader.close();
            Err(Error::new(error, summary))
        }
    }
}

/// Copies and moves between registered backends.
#[derive(Debug)]
pub struct Engine {
    backends: std::collections::HashMap<String, Arc<dyn FileShare>>,
    broker: Arc<Broker>,
    stream: common::StreamConfig,
}

impl Engine {
    pub fn new(broker: Arc<Broker>, stream: common::StreamConfig) -> Self {
        Self {
            backends: std::collections::HashMap::new(),
            broker,
            stream,
        }
    }

    /// Serves connections with the backend's scheme; replaces a backend registered earlier.
    pub fn register(&mut self, backend: Arc<dyn FileShare>) {
        self.backends
            .insert(backend.connection_type().to_string(), backend);
    }

    pub fn backend(&self, conn: &Connection) -> anyhow::Result<&Arc<dyn FileShare>> {
        self.backends
            .get(&conn.scheme)
            .ok_or_else(|| anyhow!("no backend registered for scheme {:?}", conn.scheme))
    }

    /// Copies `src` to `dest`, using the backend's own copy when both are on the same host.
    #[instrument(skip(self))]
    pub async fn copy(
        &self,
        src: &Connection,
        dest: &Connection,
        opts: &FileCopyOpts,
    ) -> Result<Summary, Error> {
        self.stream
            .validate()
            .map_err(|err| Error::new(anyhow!(err), Summary::default()))?;
        let src_client = self
            .backend(src)
            .map_err(|err| Error::new(err, Summary::default()))?;
        let dest_client = self
            .backend(dest)
            .map_err(|err| Error::new(err, Summary::default()))?;
        if src.same_host(dest) && !self.stream.force_stream {
            return src_client.copy_internal(src, dest, opts).await;
        }
        prefix_copy_remote(
            &self.broker,
            self.stream.window,
            src_client.as_ref(),
            dest_client.as_ref(),
            src,
            dest,
            opts,
        )
        .await
    }

    /// Copies `src` to `dest`, then deletes `src`.
    #[instrument(skip(self))]
    pub async fn move_path(
        &self,
        src: &Connection,
        dest: &Connection,
        opts: &FileCopyOpts,
    ) -> Result<Summary, Error> {
        let src_key = common::path::clean_path_prefix(&src.path)
            .context("error cleaning source path")
            .map_err(|err| Error::new(err, Summary::default()))?;
        if src_key.is_empty() {
            return Err(Error::new(
                anyhow!("refusing to move the root of {}", src),
                Summary::default(),
            ));
        }
        let mut summary = self.copy(src, dest, opts).await?;
        let src_client = self
            .backend(src)
            .map_err(|err| Error::new(err, summary))?;
        let removed = src_client
            .delete(&src.with_path(&src_key), opts.recursive)
            .await
            .with_context(|| format!("failed removing source {src} after copying it"))
            .map_err(|err| Error::new(err, summary))?;
        summary.entries_deleted += removed;
        Ok(summary)
    }
}
