//! Tar archives streamed through flow-controlled streams.
//!
//! The source side ([`TarSource`]) feeds entries to a `tar::Builder` running on a blocking thread;
//! the archive it writes goes into an in-memory pipe while a pump task moves the pipe contents into
//! a stream [`Writer`]. The destination side ([`tar_copy_dest`]) pumps a stream [`Reader`] into
//! another pipe that a `tar::Archive` reads, handing each entry's bytes to an [`EntryHandler`]
//! without buffering whole files. Backpressure flows end to end: a slow handler stops the decoder,
//! which stops acknowledging the stream, which blocks the source writer.
//!
//! Headers use the GNU format. Names that do not fit the 100-byte name field are written as GNU
//! long-name records; on decode, GNU long names and PAX `path` and `size` records are honored.

use anyhow::{Context, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;

use crate::cancel::CancelScope;
use crate::protocol::MAX_CHUNK_SIZE;
use crate::streams::{Reader, Writer};

/// Number of attempts made to finish the tar writer and the pipe when closing a source.
pub const MAX_CLOSE_RETRIES: usize = 5;

/// Delay between two close attempts.
pub const CLOSE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(10);

// how long the destination waits for the end of the stream after the end-of-archive marker
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const PIPE_CAPACITY: usize = 2 * MAX_CHUNK_SIZE;

/// What the source knows about an entry before writing it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryMeta {
    pub size: u64,
    pub is_dir: bool,
    pub mode: u32,
    pub mtime: u64,
}

/// A decoded tar header. `name` has no trailing slash; the root of the archive is `.`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mode: u32,
    pub mtime: u64,
}

/// Rejects names that could escape the destination: absolute paths and `..` components.
pub fn validate_path(path: &str) -> anyhow::Result<()> {
    if path.starts_with('/') {
        bail!("invalid tar path {:?}: absolute paths are not allowed", path);
    }
    if path.split('/').any(|part| part == "..") {
        bail!("invalid tar path {:?}: \"..\" is not allowed", path);
    }
    Ok(())
}

/// Name of the entry for `path` in an archive rooted at `prefix`.
///
/// The prefix itself collapses to `.`; empty and `.` components are dropped.
pub fn entry_name(path: &str, prefix: &str) -> anyhow::Result<String> {
    let prefix = prefix.trim_end_matches('/');
    let relative = if path.trim_end_matches('/') == prefix {
        ""
    } else if prefix.is_empty() {
        path
    } else {
        path.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(path)
    };
    validate_path(relative)?;
    let parts: Vec<&str> = relative
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    if parts.is_empty() {
        return Ok(".".to_string());
    }
    Ok(parts.join("/"))
}

// The name is filled in by `tar::Builder::append_data`.
fn build_header(meta: &EntryMeta) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    let (entry_type, size, default_mode) = if meta.is_dir {
        (tar::EntryType::Directory, 0, 0o755)
    } else {
        (tar::EntryType::Regular, meta.size, 0o644)
    };
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(if meta.mode == 0 {
        default_mode
    } else {
        meta.mode & 0o7777
    });
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(meta.mtime);
    header
}

fn finish_with_retry(
    what: &str,
    mut step: impl FnMut() -> std::io::Result<()>,
) -> anyhow::Result<()> {
    let mut attempt = 1;
    loop {
        match step() {
            Ok(()) => return Ok(()),
            Err(error) if attempt < MAX_CLOSE_RETRIES => {
                tracing::warn!(
                    "failed to close {} (attempt {}/{}): {}",
                    what,
                    attempt,
                    MAX_CLOSE_RETRIES,
                    error
                );
                attempt += 1;
                std::thread::sleep(CLOSE_RETRY_DELAY);
            }
            Err(error) => {
                return Err(anyhow!(error))
                    .with_context(|| format!("failed to close {what} after {attempt} attempts"));
            }
        }
    }
}

struct Job {
    header: tar::Header,
    name: String,
    content: SyncIoBridge<tokio::io::DuplexStream>,
}

// Runs on a blocking thread: `tar::Builder` only does synchronous I/O.
fn build_archive(
    mut jobs: mpsc::Receiver<Job>,
    output: SyncIoBridge<tokio::io::DuplexStream>,
) -> anyhow::Result<()> {
    let mut builder = tar::Builder::new(output);
    while let Some(mut job) = jobs.blocking_recv() {
        builder
            .append_data(&mut job.header, &job.name, &mut job.content)
            .with_context(|| format!("failed writing tar entry {:?}", job.name))?;
    }
    let mut output = builder
        .into_inner()
        .context("failed writing the end of the tar archive")?;
    finish_with_retry("tar writer", || std::io::Write::flush(&mut output))?;
    finish_with_retry("pipe writer", || output.shutdown())
}

/// Encodes a tar archive into a stream writer.
#[derive(Debug)]
pub struct TarSource {
    jobs: Option<mpsc::Sender<Job>>,
    prefix: String,
    // entry whose content is being written and the bytes still owed
    content: Option<tokio::io::DuplexStream>,
    current: Option<String>,
    remaining: u64,
    scope: CancelScope,
    builder: tokio::task::JoinHandle<anyhow::Result<()>>,
    pump: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TarSource {
    /// Starts encoding into `writer`; entry names are made relative to `path_prefix`.
    ///
    /// Must be called within a tokio runtime. Canceling `scope` terminates the stream with the
    /// cancellation cause.
    pub fn new(
        writer: std::sync::Arc<Writer>,
        path_prefix: &str,
        scope: CancelScope,
    ) -> Self {
        let (pipe, pump_end) = tokio::io::duplex(PIPE_CAPACITY);
        let pump = tokio::spawn(pump_to_stream(pump_end, writer, scope.clone()));
        let (jobs, queue) = mpsc::channel(1);
        let output = SyncIoBridge::new(pipe);
        let builder = tokio::task::spawn_blocking(move || build_archive(queue, output));
        Self {
            jobs: Some(jobs),
            prefix: path_prefix.to_string(),
            content: None,
            current: None,
            remaining: 0,
            scope,
            builder,
            pump,
        }
    }

    /// Writes the header of the next entry; a regular file must be followed by exactly
    /// `meta.size` bytes of content.
    pub async fn write_header(&mut self, meta: &EntryMeta, path: &str) -> anyhow::Result<()> {
        self.finish_entry()?;
        let mut name = entry_name(path, &self.prefix)?;
        if meta.is_dir {
            name.push('/');
        }
        tracing::debug!("tar header: {:?} (size: {})", name, meta.size);
        let Some(jobs) = &self.jobs else {
            bail!("tar source for {:?} is closed", self.prefix);
        };
        let (content, content_end) = tokio::io::duplex(PIPE_CAPACITY);
        let job = Job {
            header: build_header(meta),
            name: name.clone(),
            content: SyncIoBridge::new(content_end),
        };
        if jobs.send(job).await.is_err() {
            if self.scope.is_cancelled() {
                return Err(self.scope.cause());
            }
            bail!("tar writer stopped before {:?}", name);
        }
        if !meta.is_dir && meta.size > 0 {
            self.content = Some(content);
            self.current = Some(name);
            self.remaining = meta.size;
        }
        Ok(())
    }

    /// Writes part of the current entry's content.
    pub async fn write_content(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.len() as u64 > self.remaining {
            bail!(
                "tar entry {:?} is longer than its header size",
                self.current.as_deref().unwrap_or_default()
            );
        }
        if data.is_empty() {
            return Ok(());
        }
        let Some(content) = self.content.as_mut() else {
            bail!("no tar entry is open");
        };
        content.write_all(data).await.with_context(|| {
            format!(
                "failed writing tar entry {:?}",
                self.current.as_deref().unwrap_or_default()
            )
        })?;
        self.remaining -= data.len() as u64;
        Ok(())
    }

    /// Copies the remaining content of the current entry from `reader`.
    pub async fn copy_content<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> anyhow::Result<u64> {
        let expected = self.remaining;
        let copied = match self.content.as_mut() {
            Some(content) => tokio::io::copy(&mut reader.take(expected), content).await?,
            None => 0,
        };
        self.remaining -= copied;
        if copied != expected {
            bail!(
                "tar entry {:?} is shorter than its header size: expected {} bytes, got {}",
                self.current.as_deref().unwrap_or_default(),
                expected,
                copied
            );
        }
        Ok(copied)
    }

    fn finish_entry(&mut self) -> anyhow::Result<()> {
        // dropping the pipe ends the entry's data for the builder
        self.content = None;
        let remaining = std::mem::take(&mut self.remaining);
        let name = self.current.take();
        if remaining != 0 {
            bail!(
                "tar entry {:?} is short by {} bytes",
                name.unwrap_or_default(),
                remaining
            );
        }
        Ok(())
    }

    /// Finishes the archive and waits until all of it was handed to the stream.
    pub async fn close(mut self) -> anyhow::Result<()> {
        if let Err(error) = self.finish_entry() {
            self.abort(&error).await;
            return Err(error);
        }
        self.jobs = None;
        let built = match self.builder.await {
            Ok(built) => built,
            Err(error) => Err(anyhow!("tar writer failed: {error}")),
        };
        if let Err(error) = &built {
            self.scope.cancel(error);
        }
        self.pump.await.context("tar stream pump failed")??;
        built
    }

    /// Terminates the stream with `error` instead of finishing the archive.
    pub async fn abort(self, error: &anyhow::Error) {
        self.scope.cancel(error);
        drop(self.jobs);
        drop(self.content);
        if let Err(error) = self.pump.await {
            tracing::debug!("tar stream pump failed: {}", error);
        }
        match self.builder.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::debug!("tar writer stopped: {:#}", error),
            Err(error) => tracing::debug!("tar writer failed: {}", error),
        }
    }
}

fn forward_cancel(writer: &Writer, scope: &CancelScope) -> anyhow::Result<()> {
    if let Err(error) = writer.close_with_error(scope.cause_message()) {
        tracing::debug!("stream {} already terminated: {}", writer.id(), error);
    }
    Err(scope.cause())
}

async fn pump_to_stream(
    mut pipe: tokio::io::DuplexStream,
    writer: std::sync::Arc<Writer>,
    scope: CancelScope,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = scope.cancelled() => return forward_cancel(&writer, &scope),
            _ = writer.canceled() => {
                scope.cancel(crate::streams::Error::Canceled);
                return Err(anyhow!(crate::streams::Error::Canceled));
            }
            read = pipe.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                writer.close()?;
                return Ok(());
            }
            Ok(n) => n,
            Err(error) => {
                scope.cancel(&error);
                return forward_cancel(&writer, &scope);
            }
        };
        let written = tokio::select! {
            biased;
            _ = scope.cancelled() => return forward_cancel(&writer, &scope),
            written = writer.write(&buf[..n]) => written,
        };
        if let Err(error) = written {
            scope.cancel(&error);
            return Err(error.into());
        }
    }
}

/// Receives the entries of an archive read by [`tar_copy_dest`].
#[async_trait::async_trait]
pub trait EntryHandler: Send {
    /// Called once per entry; `content` yields at most `header.size` bytes. Content left unread is
    /// skipped.
    async fn handle_entry(
        &mut self,
        header: &EntryHeader,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<()>;
}

enum Decoded {
    Entry(EntryHeader, tokio::io::DuplexStream),
    End,
    Failed(anyhow::Error),
}

fn entry_header<R: std::io::Read>(
    entry: &tar::Entry<'_, R>,
) -> anyhow::Result<Option<EntryHeader>> {
    let name = String::from_utf8(entry.path_bytes().into_owned())
        .context("tar entry name is not UTF-8")?;
    let entry_type = entry.header().entry_type();
    let is_dir = entry_type.is_dir() || name.ends_with('/');
    if !is_dir && !entry_type.is_file() {
        tracing::warn!("skipping tar entry {:?} of type {:?}", name, entry_type);
        return Ok(None);
    }
    let name = match name.trim_end_matches('/') {
        "" => ".".to_string(),
        trimmed => trimmed.to_string(),
    };
    validate_path(&name)?;
    Ok(Some(EntryHeader {
        name,
        size: if is_dir { 0 } else { entry.size() },
        is_dir,
        mode: entry.header().mode()?,
        mtime: entry.header().mtime()?,
    }))
}

// Returns false once nobody reads the entries anymore.
fn send_entries<R: std::io::Read>(
    archive: &mut tar::Archive<R>,
    decoded: &mpsc::Sender<Decoded>,
    handle: &tokio::runtime::Handle,
) -> anyhow::Result<bool> {
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(header) = entry_header(&entry)? else {
            continue;
        };
        let (content_end, content) = tokio::io::duplex(PIPE_CAPACITY);
        if decoded
            .blocking_send(Decoded::Entry(header, content_end))
            .is_err()
        {
            return Ok(false);
        }
        let mut content = SyncIoBridge::new_with_handle(content, handle.clone());
        loop {
            let n = std::io::Read::read(&mut entry, &mut buf)?;
            if n == 0 {
                break;
            }
            // the handler is done with this entry, the archive skips the rest
            if std::io::Write::write_all(&mut content, &buf[..n]).is_err() {
                break;
            }
        }
    }
    Ok(true)
}

// Runs on a blocking thread: `tar::Archive` only does synchronous I/O.
fn decode_archive(
    input: SyncIoBridge<tokio::io::DuplexStream>,
    decoded: mpsc::Sender<Decoded>,
    handle: tokio::runtime::Handle,
) {
    let mut archive = tar::Archive::new(input);
    let ended = match send_entries(&mut archive, &decoded, &handle) {
        Ok(true) => decoded.blocking_send(Decoded::End).is_ok(),
        Ok(false) => false,
        Err(error) => {
            if decoded.blocking_send(Decoded::Failed(error)).is_err() {
                tracing::debug!("tar decode error after the destination stopped");
            }
            false
        }
    };
    drop(decoded);
    if ended {
        // consume the stream up to its end so that the writer finishes cleanly
        match std::io::copy(&mut archive.into_inner(), &mut std::io::sink()) {
            Ok(0) => {}
            Ok(n) => tracing::debug!("skipped {} bytes after the end of the tar archive", n),
            Err(error) => tracing::debug!("failed draining the tar stream: {}", error),
        }
    }
}

async fn pump_from_stream(
    reader: std::sync::Arc<Reader>,
    mut pipe: tokio::io::DuplexStream,
    scope: CancelScope,
) {
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        match read {
            // dropping the pipe is the end of input for the decoder
            Ok(0) => return,
            Ok(n) => {
                if let Err(error) = pipe.write_all(&buf[..n]).await {
                    tracing::debug!("tar decoder stopped reading: {}", error);
                    return;
                }
            }
            Err(error) => {
                scope.cancel(&error);
                return;
            }
        }
    }
}

// Returns false at the end of the archive.
async fn next_entry<H: EntryHandler + ?Sized>(
    entries: &mut mpsc::Receiver<Decoded>,
    handler: &mut H,
) -> anyhow::Result<bool> {
    match entries.recv().await {
        Some(Decoded::Entry(header, mut content)) => {
            tracing::debug!("tar entry: {:?} (size: {})", header.name, header.size);
            handler
                .handle_entry(&header, &mut content)
                .await
                .with_context(|| format!("failed handling tar entry {:?}", header.name))?;
            Ok(true)
        }
        Some(Decoded::End) => Ok(false),
        Some(Decoded::Failed(error)) => Err(error.context("error reading tar stream")),
        None => Err(anyhow!("tar decoder stopped unexpectedly")),
    }
}

async fn handle_entries<H: EntryHandler + ?Sized>(
    mut entries: mpsc::Receiver<Decoded>,
    scope: &CancelScope,
    handler: &mut H,
) -> anyhow::Result<()> {
    loop {
        let step = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(scope.cause()),
            step = next_entry(&mut entries, handler) => step,
        };
        match step {
            Ok(true) => continue,
            Ok(false) | Err(_) if scope.is_cancelled() => return Err(scope.cause()),
            Ok(false) => return Ok(()),
            Err(error) => return Err(error),
        }
    }
}

/// Decodes the archive arriving on `reader`, calling `handler` for every entry.
///
/// Returns once the end of the archive is reached and the stream has ended. Cancellation of
/// `scope` takes priority over decoding errors; any failure cancels `scope`. The reader is closed
/// on return so that the writing side stops.
pub async fn tar_copy_dest<H: EntryHandler + ?Sized>(
    reader: std::sync::Arc<Reader>,
    scope: CancelScope,
    handler: &mut H,
) -> anyhow::Result<()> {
    let (pipe, pump_end) = tokio::io::duplex(PIPE_CAPACITY);
    let pump = tokio::spawn(pump_from_stream(reader.clone(), pump_end, scope.clone()));
    let (decoded, entries) = mpsc::channel(1);
    let mut decoder = {
        let input = SyncIoBridge::new(pipe);
        let handle = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || decode_archive(input, decoded, handle))
    };
    let result = handle_entries(entries, &scope, handler).await;
    if result.is_ok() && tokio::time::timeout(DRAIN_TIMEOUT, &mut decoder).await.is_err() {
        tracing::warn!("stream {} did not end after the tar trailer", reader.id());
    }
    reader.close();
    pump.abort();
    if let Err(error) = &result {
        scope.cancel(error);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Collect {
        entries: Vec<(EntryHeader, Vec<u8>)>,
        fail_on: Option<String>,
    }

    #[async_trait::async_trait]
    impl EntryHandler for Collect {
        async fn handle_entry(
            &mut self,
            header: &EntryHeader,
            content: &mut (dyn AsyncRead + Send + Unpin),
        ) -> anyhow::Result<()> {
            if self.fail_on.as_deref() == Some(header.name.as_str()) {
                bail!("no space left for {}", header.name);
            }
            let mut data = Vec::new();
            content.read_to_end(&mut data).await?;
            self.entries.push((header.clone(), data));
            Ok(())
        }
    }

    async fn send_archive(writer: Arc<Writer>, archive: Vec<u8>) -> anyhow::Result<()> {
        writer.write(&archive).await?;
        writer.close()?;
        Ok(())
    }

    fn stream_pair(broker: &Broker, window: u64) -> (Arc<Writer>, Arc<Reader>) {
        let (reader, meta) = broker.create_reader(window);
        let writer = broker.create_writer(&meta).unwrap();
        (writer, reader)
    }

    fn file(size: u64) -> EntryMeta {
        EntryMeta {
            size,
            mode: 0o600,
            mtime: 1_700_000_000,
            ..Default::default()
        }
    }

    fn dir() -> EntryMeta {
        EntryMeta {
            is_dir: true,
            ..Default::default()
        }
    }

    #[test]
    fn entry_names() -> anyhow::Result<()> {
        assert_eq!(entry_name("data", "data/")?, ".");
        assert_eq!(entry_name("data/", "data")?, ".");
        assert_eq!(entry_name("data/sub/a.txt", "data/")?, "sub/a.txt");
        assert_eq!(entry_name("data/sub/a.txt", "data")?, "sub/a.txt");
        assert_eq!(entry_name("a/b", "")?, "a/b");
        assert_eq!(entry_name("data/./x//y", "data")?, "x/y");
        // only whole components are stripped
        assert_eq!(entry_name("database/x", "data")?, "database/x");
        assert!(entry_name("data/../etc/passwd", "data").is_err());
        assert!(entry_name("/etc/passwd", "data").is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn round_trip_entries() -> anyhow::Result<()> {
        let broker = Broker::loopback();
        let (writer, reader) = stream_pair(&broker, 1024);
        let long_name = format!("data/{}/file.bin", "x".repeat(150));
        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let producer = {
            let long_name = long_name.clone();
            let big = big.clone();
            tokio::spawn(async move {
                let mut source = TarSource::new(writer, "data/", CancelScope::new());
                source.write_header(&dir(), "data").await?;
                source.write_header(&dir(), "data/sub").await?;
                source.write_header(&file(5), "data/sub/a.txt").await?;
                source.write_content(b"hello").await?;
                source.write_header(&file(0), "data/empty").await?;
                source
                    .write_header(&file(big.len() as u64), &long_name)
                    .await?;
                source.copy_content(&mut big.as_slice()).await?;
                source.close().await
            })
        };
        let mut collect = Collect::default();
        tar_copy_dest(reader, CancelScope::new(), &mut collect).await?;
        producer.await??;
        let names: Vec<(&str, bool)> = collect
            .entries
            .iter()
            .map(|(header, _)| (header.name.as_str(), header.is_dir))
            .collect();
        let long_entry = format!("{}/file.bin", "x".repeat(150));
        assert_eq!(
            names,
            vec![
                (".", true),
                ("sub", true),
                ("sub/a.txt", false),
                ("empty", false),
                (long_entry.as_str(), false),
            ]
        );
        assert_eq!(collect.entries[2].1, b"hello");
        assert_eq!(collect.entries[2].0.mode, 0o600);
        assert_eq!(collect.entries[2].0.mtime, 1_700_000_000);
        assert!(collect.entries[3].1.is_empty());
        assert_eq!(collect.entries[4].1, big);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unread_content_is_skipped() -> anyhow::Result<()> {
        struct NamesOnly(Vec<String>);
        #[async_trait::async_trait]
        impl EntryHandler for NamesOnly {
            async fn handle_entry(
                &mut self,
                header: &EntryHeader,
                _content: &mut (dyn AsyncRead + Send + Unpin),
            ) -> anyhow::Result<()> {
                self.0.push(header.name.clone());
                Ok(())
            }
        }
        let broker = Broker::loopback();
        let (writer, reader) = stream_pair(&broker, 4096);
        let producer = tokio::spawn(async move {
            let mut source = TarSource::new(writer, "", CancelScope::new());
            source.write_header(&file(700), "a").await?;
            source.write_content(&[1u8; 700]).await?;
            source.write_header(&file(3), "b").await?;
            source.write_content(b"xyz").await?;
            source.close().await
        });
        let mut names = NamesOnly(Vec::new());
        tar_copy_dest(reader, CancelScope::new(), &mut names).await?;
        producer.await??;
        assert_eq!(names.0, vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn short_entry_is_an_error() {
        let broker = Broker::loopback();
        let (writer, _reader) = stream_pair(&broker, 4096);
        let mut source = TarSource::new(writer, "", CancelScope::new());
        source.write_header(&file(10), "a").await.unwrap();
        source.write_content(b"12345").await.unwrap();
        let error = source.write_header(&file(1), "b").await.unwrap_err();
        assert!(error.to_string().contains("short by 5 bytes"), "{error:#}");
        assert!(source.write_content(&[0u8; 20]).await.is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn source_abort_reaches_destination() {
        let broker = Broker::loopback();
        let (writer, reader) = stream_pair(&broker, 1024);
        let producer = tokio::spawn(async move {
            let mut source = TarSource::new(writer, "", CancelScope::new());
            source.write_header(&file(2), "a").await?;
            source.write_content(b"ok").await?;
            source.abort(&anyhow!("disk read failed")).await;
            Ok::<_, anyhow::Error>(())
        });
        let scope = CancelScope::new();
        let mut collect = Collect::default();
        let error = tar_copy_dest(reader, scope.clone(), &mut collect)
            .await
            .unwrap_err();
        producer.await.unwrap().unwrap();
        assert!(
            format!("{error:#}").contains("stream error: disk read failed"),
            "{error:#}"
        );
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    #[traced_test]
    async fn cancellation_takes_priority() {
        let broker = Broker::loopback();
        let (writer, reader) = stream_pair(&broker, 1024);
        let scope = CancelScope::new();
        scope.cancel("user canceled");
        let mut collect = Collect::default();
        let error = tar_copy_dest(reader, scope, &mut collect).await.unwrap_err();
        assert_eq!(error.to_string(), "user canceled");
        tokio::time::timeout(std::time::Duration::from_secs(1), writer.canceled())
            .await
            .expect("source was not canceled");
    }

    #[tokio::test]
    #[traced_test]
    async fn handler_error_stops_the_source() {
        let broker = Broker::loopback();
        let (writer, reader) = stream_pair(&broker, 1024);
        let source_scope = CancelScope::new();
        let producer = {
            let source_scope = source_scope.clone();
            tokio::spawn(async move {
                let mut source = TarSource::new(writer, "", source_scope);
                for idx in 0..1000 {
                    source.write_header(&file(1000), &format!("f{idx}")).await?;
                    source.write_content(&[0u8; 1000]).await?;
                }
                source.close().await
            })
        };
        let mut collect = Collect {
            fail_on: Some("f3".to_string()),
            ..Default::default()
        };
        let error = tar_copy_dest(reader, CancelScope::new(), &mut collect)
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("no space left for f3"), "{error:#}");
        let produced = tokio::time::timeout(std::time::Duration::from_secs(2), producer)
            .await
            .expect("producer kept running")
            .unwrap();
        assert!(produced.is_err());
        assert!(source_scope.is_cancelled());
        assert_eq!(collect.entries.len(), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn garbage_is_a_decode_error() {
        let broker = Broker::loopback();
        let (writer, reader) = stream_pair(&broker, 4096);
        writer.write(&[b'x'; 512]).await.unwrap();
        writer.close().unwrap();
        let mut collect = Collect::default();
        let error = tar_copy_dest(reader, CancelScope::new(), &mut collect)
            .await
            .unwrap_err();
        assert!(error.to_string().starts_with("error reading tar stream"), "{error:#}");
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_stream_is_an_empty_archive() -> anyhow::Result<()> {
        let broker = Broker::loopback();
        let (writer, reader) = stream_pair(&broker, 4096);
        writer.close()?;
        let mut collect = Collect::default();
        tar_copy_dest(reader, CancelScope::new(), &mut collect).await?;
        assert!(collect.entries.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn pax_path_overrides_the_header_name() -> anyhow::Result<()> {
        let long_name = format!("{}/file.txt", "d".repeat(120));
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_pax_extensions([("path", long_name.as_bytes())])?;
        let mut header = tar::Header::new_ustar();
        header.set_path("truncated")?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"hello"[..])?;
        let archive = builder.into_inner()?;
        let broker = Broker::loopback();
        let (writer, reader) = stream_pair(&broker, 1024);
        let producer = tokio::spawn(send_archive(writer, archive));
        let mut collect = Collect::default();
        tar_copy_dest(reader, CancelScope::new(), &mut collect).await?;
        producer.await??;
        assert_eq!(collect.entries.len(), 1);
        assert_eq!(collect.entries[0].0.name, long_name);
        assert_eq!(collect.entries[0].1, b"hello");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn pax_escape_is_rejected() {
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_pax_extensions([("path", &b"../outside.txt"[..])])
            .unwrap();
        let mut header = tar::Header::new_ustar();
        header.set_path("inside.txt").unwrap();
        header.set_size(1);
        header.set_cksum();
        builder.append(&header, &b"x"[..]).unwrap();
        let archive = builder.into_inner().unwrap();
        let broker = Broker::loopback();
        let (writer, reader) = stream_pair(&broker, 4096);
        let producer = tokio::spawn(send_archive(writer, archive));
        let mut collect = Collect::default();
        let error = tar_copy_dest(reader, CancelScope::new(), &mut collect)
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("is not allowed"), "{error:#}");
        assert!(collect.entries.is_empty());
        let _ = producer.await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn stream_end_is_drained_before_closing() -> anyhow::Result<()> {
        // with a small window the second end-of-archive block is still in flight when the
        // decoder stops at the first one
        for window in [8, 16, 64] {
            let broker = Broker::loopback();
            let (writer, reader) = stream_pair(&broker, window);
            let producer = tokio::spawn(async move {
                let mut source = TarSource::new(writer, "", CancelScope::new());
                source.write_header(&file(3), "a.txt").await?;
                source.write_content(b"abc").await?;
                source.close().await
            });
            let scope = CancelScope::new();
            let mut collect = Collect::default();
            tar_copy_dest(reader, scope.clone(), &mut collect).await?;
            producer.await??;
            assert!(!scope.is_cancelled(), "window {window}");
            assert_eq!(collect.entries.len(), 1);
            assert_eq!(collect.entries[0].1, b"abc");
        }
        Ok(())
    }

    #[test]
    fn close_retries_transient_failures() {
        let mut attempts = 0;
        finish_with_retry("test writer", || {
            attempts += 1;
            if attempts <= 3 {
                return Err(std::io::Error::other("transient"));
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(attempts, 4);
        let mut attempts = 0;
        let error = finish_with_retry("test writer", || {
            attempts += 1;
            Err(std::io::Error::other("broken"))
        })
        .unwrap_err();
        assert_eq!(attempts, MAX_CLOSE_RETRIES);
        assert!(error.to_string().contains("after 5 attempts"), "{error:#}");
    }
}
