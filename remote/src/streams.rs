//! Flow-controlled byte streams over a fire-and-forget packet transport.
//!
//! A stream has exactly one [`Writer`] and one [`Reader`], usually on different hosts, connected
//! through some [`Transport`]. The writer never has more than `window` bytes in flight: every
//! [`DataPacket`] consumes credit and credit is returned by cumulative [`AckPacket`]s that the
//! reader sends as the application consumes bytes. A slow reader therefore stalls the writer
//! instead of growing buffers on either side.
//!
//! Both endpoints keep their state behind a mutex and wake waiters through a [`tokio::sync::Notify`].
//! Packets are sent while holding the state lock so that they leave in sequence order; transports
//! must never call back into the endpoint synchronously.

use bytes::Buf;

use crate::protocol::{AckPacket, DataPacket, MAX_CHUNK_SIZE, Transport};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The peer (or this side) terminated the stream with an error.
    #[error("stream error: {0}")]
    Stream(String),
    /// The reader went away before the stream completed.
    #[error("stream canceled")]
    Canceled,
    /// The local endpoint was already closed.
    #[error("stream closed")]
    Closed,
}

/// Snapshot of the writer side flow-control counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AckState {
    pub sent: u64,
    pub acked: u64,
    pub canceled: bool,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct WriterState {
    sent: u64,
    acked: u64,
    fin_acked: bool,
    canceled: bool,
    closed: bool,
    error: Option<String>,
}

impl WriterState {
    fn check_open(&self) -> Result<(), Error> {
        if let Some(error) = &self.error {
            return Err(Error::Stream(error.clone()));
        }
        if self.canceled {
            return Err(Error::Canceled);
        }
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

/// Sending half of a stream.
pub struct Writer {
    id: String,
    window: u64,
    transport: std::sync::Arc<dyn Transport>,
    state: std::sync::Mutex<WriterState>,
    changed: tokio::sync::Notify,
    // serializes concurrent `write` calls, tokio's mutex is fair so writers are served FIFO
    write_order: tokio::sync::Mutex<()>,
    canceled: tokio_util::sync::CancellationToken,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("id", &self.id)
            .field("window", &self.window)
            .field("state", &*lock(&self.state))
            .finish_non_exhaustive()
    }
}

impl Writer {
    pub fn new(
        id: impl Into<String>,
        window: u64,
        transport: std::sync::Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: id.into(),
            window: window.max(1),
            transport,
            state: std::sync::Mutex::new(WriterState::default()),
            changed: tokio::sync::Notify::new(),
            write_order: tokio::sync::Mutex::new(()),
            canceled: tokio_util::sync::CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// Sends all of `data`, waiting for window credit as needed.
    ///
    /// Returns the number of bytes written, which is always `data.len()` on success. Fails as soon
    /// as the stream is closed, canceled by the reader or terminated with an error, in which case
    /// a prefix of `data` may already have been sent.
    pub async fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let _order = self.write_order.lock().await;
        if data.is_empty() {
            lock(&self.state).check_open()?;
            return Ok(0);
        }
        let mut written = 0;
        while written < data.len() {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            {
                let mut state = lock(&self.state);
                state.check_open()?;
                let available = self.window.saturating_sub(state.sent - state.acked);
                if available > 0 {
                    let len = (data.len() - written)
                        .min(MAX_CHUNK_SIZE)
                        .min(usize::try_from(available).unwrap_or(usize::MAX));
                    let payload = bytes::Bytes::copy_from_slice(&data[written..written + len]);
                    self.transport.send_data(DataPacket {
                        stream_id: self.id.clone(),
                        seq: state.sent,
                        payload,
                        eof: false,
                        error: None,
                    });
                    state.sent += len as u64;
                    written += len;
                    continue;
                }
            }
            tracing::trace!("stream {}: waiting for window credit", self.id);
            changed.await;
        }
        Ok(written)
    }

    /// Ends the stream; the reader sees end-of-file once it consumed all bytes.
    ///
    /// Closing twice is a no-op. Fails if the stream was terminated with an error.
    pub fn close(&self) -> Result<(), Error> {
        self.finish(None)
    }

    /// Ends the stream with an error; the reader fails with `stream error: <error>`.
    pub fn close_with_error(&self, error: impl std::fmt::Display) -> Result<(), Error> {
        self.finish(Some(format!("{error:#}")))
    }

    fn finish(&self, error: Option<String>) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if let Some(existing) = &state.error {
            return Err(Error::Stream(existing.clone()));
        }
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.error = error.clone();
        self.transport.send_data(DataPacket {
            stream_id: self.id.clone(),
            seq: state.sent,
            payload: bytes::Bytes::new(),
            eof: error.is_none(),
            error,
        });
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Applies an acknowledgement from the reader.
    ///
    /// Acks for other streams and acks that do not advance the acknowledged length are ignored
    /// apart from their terminal flags.
    pub fn recv_ack(&self, ack: &AckPacket) {
        if ack.stream_id != self.id {
            return;
        }
        let mut state = lock(&self.state);
        if ack.acked_len > state.acked {
            state.acked = ack.acked_len.min(state.sent);
        }
        if ack.fin {
            state.fin_acked = true;
        }
        // a canceled stream stays canceled, late errors do not replace that outcome
        if state.error.is_none() && !state.canceled {
            state.error = ack.error.clone();
        }
        // once the reader has seen the whole stream a cancel only means it let go of it
        let newly_canceled = ack.cancel && !state.canceled && !state.fin_acked;
        if newly_canceled {
            state.canceled = true;
        }
        drop(state);
        if newly_canceled {
            tracing::debug!("stream {}: canceled by reader", self.id);
            self.canceled.cancel();
        }
        self.changed.notify_waiters();
    }

    pub fn ack_state(&self) -> AckState {
        let state = lock(&self.state);
        AckState {
            sent: state.sent,
            acked: state.acked,
            canceled: state.canceled,
        }
    }

    /// Whether the reader reported that it received the end of the stream.
    pub fn is_fin_acked(&self) -> bool {
        lock(&self.state).fin_acked
    }

    /// Completes once the reader cancels the stream.
    pub fn canceled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.canceled.cancelled()
    }

    pub fn cancellation_token(&self) -> tokio_util::sync::CancellationToken {
        self.canceled.clone()
    }
}

#[derive(Debug, Default)]
struct ReaderState {
    buffer: bytes::BytesMut,
    // stream offset expected from the next in-order packet
    next_seq: u64,
    consumed: u64,
    last_acked: u64,
    eof: bool,
    error: Option<String>,
    closed: bool,
    // packets that arrived ahead of `next_seq`
    pending: std::collections::BTreeMap<u64, DataPacket>,
}

impl ReaderState {
    fn is_done(&self) -> bool {
        self.closed || self.eof || self.error.is_some()
    }

    fn append(&mut self, packet: DataPacket) {
        self.next_seq += packet.payload.len() as u64;
        self.buffer.extend_from_slice(&packet.payload);
        if packet.eof {
            self.eof = true;
        }
    }

    fn next_pending(&mut self) -> Option<DataPacket> {
        while let Some(entry) = self.pending.first_entry() {
            match entry.key().cmp(&self.next_seq) {
                std::cmp::Ordering::Less => {
                    entry.remove();
                }
                std::cmp::Ordering::Equal => return Some(entry.remove()),
                std::cmp::Ordering::Greater => return None,
            }
        }
        None
    }
}

/// Receiving half of a stream.
pub struct Reader {
    id: String,
    window: u64,
    transport: std::sync::Arc<dyn Transport>,
    state: std::sync::Mutex<ReaderState>,
    changed: tokio::sync::Notify,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("id", &self.id)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl Reader {
    pub fn new(
        id: impl Into<String>,
        window: u64,
        transport: std::sync::Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: id.into(),
            window: window.max(1),
            transport,
            state: std::sync::Mutex::new(ReaderState::default()),
            changed: tokio::sync::Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    fn ack_threshold(&self) -> u64 {
        (self.window / 5).max(1)
    }

    fn send_ack(&self, state: &ReaderState, fin: bool, cancel: bool) {
        self.transport.send_ack(AckPacket {
            stream_id: self.id.clone(),
            acked_len: state.consumed,
            fin,
            cancel,
            error: None,
        });
    }

    /// Accepts a data packet from the writer.
    ///
    /// Packets ahead of the expected offset are held until the gap is filled, packets behind it
    /// are duplicates and dropped. Once the stream ended (eof, error or close) this is a no-op.
    pub fn recv_data(&self, mut packet: DataPacket) {
        if packet.stream_id != self.id {
            return;
        }
        let mut state = lock(&self.state);
        if state.is_done() {
            return;
        }
        if let Some(error) = packet.error.take() {
            tracing::debug!("stream {}: writer failed: {}", self.id, error);
            state.error = Some(error);
            state.pending.clear();
            self.send_ack(&state, true, false);
            drop(state);
            self.changed.notify_waiters();
            return;
        }
        if packet.seq < state.next_seq {
            tracing::trace!("stream {}: dropping duplicate at {}", self.id, packet.seq);
            return;
        }
        if packet.seq > state.next_seq {
            state.pending.entry(packet.seq).or_insert(packet);
            return;
        }
        let mut next = Some(packet);
        while let Some(packet) = next {
            state.append(packet);
            next = if state.eof {
                None
            } else {
                state.next_pending()
            };
        }
        if state.eof {
            state.pending.clear();
            self.send_ack(&state, true, false);
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// Reads buffered bytes into `buf`, waiting until some are available.
    ///
    /// Returns `Ok(0)` at end of stream. A stream error takes priority over bytes still buffered.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            {
                let mut state = lock(&self.state);
                if state.closed {
                    return Err(Error::Closed);
                }
                if let Some(error) = &state.error {
                    return Err(Error::Stream(error.clone()));
                }
                if buf.is_empty() {
                    return Ok(0);
                }
                if !state.buffer.is_empty() {
                    let len = buf.len().min(state.buffer.len());
                    buf[..len].copy_from_slice(&state.buffer[..len]);
                    state.buffer.advance(len);
                    state.consumed += len as u64;
                    if state.buffer.is_empty()
                        || state.consumed - state.last_acked >= self.ack_threshold()
                    {
                        state.last_acked = state.consumed;
                        self.send_ack(&state, false, false);
                    }
                    return Ok(len);
                }
                if state.eof {
                    return Ok(0);
                }
            }
            changed.await;
        }
    }

    /// Abandons the stream; the writer observes a cancellation rather than an error.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        state.buffer.clear();
        state.pending.clear();
        self.send_ack(&state, false, true);
        drop(state);
        self.changed.notify_waiters();
    }
}
