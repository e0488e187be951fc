use serde::{Deserialize, Serialize};

/// Largest payload carried by a single [`DataPacket`].
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Payload bytes of a stream, sent from the writer to the reader.
///
/// `seq` is the stream offset of the first payload byte. The final packet of a stream either has
/// `eof` set or carries an `error`, in both cases with an empty payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DataPacket {
    pub stream_id: String,
    pub seq: u64,
    pub payload: bytes::Bytes,
    pub eof: bool,
    pub error: Option<String>,
}

impl DataPacket {
    pub fn is_terminal(&self) -> bool {
        self.eof || self.error.is_some()
    }
}

/// Reader state reported back to the writer.
///
/// `acked_len` is cumulative: it counts every byte the reader has consumed so far. `fin` tells the
/// writer that the reader saw the end of the stream, `cancel` that the reader went away.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AckPacket {
    pub stream_id: String,
    pub acked_len: u64,
    pub fin: bool,
    pub cancel: bool,
    pub error: Option<String>,
}

impl AckPacket {
    pub fn is_terminal(&self) -> bool {
        self.fin || self.cancel
    }
}

/// Either kind of packet, as carried by a transport that multiplexes both directions.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Packet {
    Data(DataPacket),
    Ack(AckPacket),
}

/// Identifies a stream created on the reading side; the writing side attaches to it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreamMeta {
    pub id: String,
    pub window: u64,
}

/// Fire-and-forget delivery of packets to the other side of a stream.
///
/// Implementations must not block and must not call back into the sending endpoint from within
/// `send_data`/`send_ack`; delivery happens asynchronously.
pub trait Transport: Send + Sync {
    fn send_data(&self, packet: DataPacket);
    fn send_ack(&self, packet: AckPacket);
}

/// Forwards packets into an unbounded channel, typically drained by a pump task.
#[derive(Clone, Debug)]
pub struct ChannelTransport {
    sender: tokio::sync::mpsc::UnboundedSender<Packet>,
}

impl ChannelTransport {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Packet>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send_data(&self, packet: DataPacket) {
        if self.sender.send(Packet::Data(packet)).is_err() {
            tracing::debug!("channel transport closed, dropping data packet");
        }
    }

    fn send_ack(&self, packet: AckPacket) {
        if self.sender.send(Packet::Ack(packet)).is_err() {
            tracing::debug!("channel transport closed, dropping ack packet");
        }
    }
}
