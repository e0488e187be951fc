//! Routes packets of many streams sharing one transport.
//!
//! The broker owns the registry of local stream endpoints. Inbound packets are dispatched by
//! stream id; outbound packets of the endpoints it created pass through it so that finished
//! streams are unregistered as soon as their terminal ack goes out (reader side) or comes in
//! (writer side).

use std::sync::{Arc, Weak};

use crate::protocol::{AckPacket, ChannelTransport, DataPacket, Packet, StreamMeta, Transport};
use crate::streams::{Reader, Writer};

/// Error sent back to a writer whose stream has no reader on this side.
pub const READER_NOT_FOUND: &str = "stream reader not found";

const NOT_FOUND_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Default)]
struct Routes {
    readers: std::collections::HashMap<String, Arc<Reader>>,
    writers: std::collections::HashMap<String, Arc<Writer>>,
    not_found_sent: std::collections::HashMap<String, std::time::Instant>,
}

pub struct Broker {
    transport: Arc<dyn Transport>,
    routes: std::sync::Mutex<Routes>,
    this: Weak<Broker>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (readers, writers) = self.stream_count();
        f.debug_struct("Broker")
            .field("readers", &readers)
            .field("writers", &writers)
            .finish_non_exhaustive()
    }
}

// Outbound path of the endpoints created by a broker. Holds a weak reference so that streams do
// not keep the broker alive.
struct BrokerSender {
    broker: Weak<Broker>,
}

impl Transport for BrokerSender {
    fn send_data(&self, packet: DataPacket) {
        if let Some(broker) = self.broker.upgrade() {
            broker.transport.send_data(packet);
        }
    }

    fn send_ack(&self, packet: AckPacket) {
        if let Some(broker) = self.broker.upgrade() {
            broker.send_ack(packet);
        }
    }
}

impl Broker {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            routes: std::sync::Mutex::new(Routes::default()),
            this: this.clone(),
        })
    }

    /// Creates a broker whose outbound packets are delivered back to itself.
    ///
    /// Used when both ends of a stream live in this process. Delivery goes through a queue drained
    /// by a background task, so it must be called within a tokio runtime.
    pub fn loopback() -> Arc<Self> {
        let (transport, receiver) = ChannelTransport::new();
        let broker = Self::new(Arc::new(transport));
        tokio::spawn(pump_packets(Arc::downgrade(&broker), receiver));
        broker
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn sender(&self) -> Arc<dyn Transport> {
        Arc::new(BrokerSender {
            broker: self.this.clone(),
        })
    }

    /// Registers a new reader; `StreamMeta` is what the writing side needs to attach to it.
    pub fn create_reader(&self, window: u64) -> (Arc<Reader>, StreamMeta) {
        let mut routes = self.routes();
        let id = loop {
            let id = format!("{:016x}", rand::random::<u64>());
            if !routes.readers.contains_key(&id) {
                break id;
            }
        };
        let reader = Arc::new(Reader::new(id.clone(), window, self.sender()));
        routes.readers.insert(id.clone(), reader.clone());
        tracing::debug!("created reader for stream {}", id);
        (reader, StreamMeta { id, window })
    }

    /// Registers a writer for a stream whose reader was created elsewhere.
    pub fn create_writer(&self, meta: &StreamMeta) -> anyhow::Result<Arc<Writer>> {
        let mut routes = self.routes();
        if routes.writers.contains_key(&meta.id) {
            anyhow::bail!("stream {} already has a writer", meta.id);
        }
        let writer = Arc::new(Writer::new(meta.id.clone(), meta.window, self.sender()));
        routes.writers.insert(meta.id.clone(), writer.clone());
        tracing::debug!("created writer for stream {}", meta.id);
        Ok(writer)
    }

    /// Number of registered readers and writers.
    pub fn stream_count(&self) -> (usize, usize) {
        let routes = self.routes();
        (routes.readers.len(), routes.writers.len())
    }

    pub fn dispatch(&self, packet: Packet) {
        match packet {
            Packet::Data(packet) => self.recv_data(packet),
            Packet::Ack(packet) => self.recv_ack(packet),
        }
    }

    pub fn recv_data(&self, packet: DataPacket) {
        let reader = self.routes().readers.get(&packet.stream_id).cloned();
        match reader {
            Some(reader) => reader.recv_data(packet),
            None => self.reader_not_found(&packet.stream_id),
        }
    }

    pub fn recv_ack(&self, packet: AckPacket) {
        let writer = {
            let mut routes = self.routes();
            if packet.is_terminal() {
                routes.writers.remove(&packet.stream_id)
            } else {
                routes.writers.get(&packet.stream_id).cloned()
            }
        };
        match writer {
            Some(writer) => writer.recv_ack(&packet),
            None => tracing::trace!("dropping ack for unknown stream {}", packet.stream_id),
        }
    }

    fn send_ack(&self, packet: AckPacket) {
        if packet.is_terminal() {
            self.routes().readers.remove(&packet.stream_id);
        }
        self.transport.send_ack(packet);
    }

    // Tells the writer to stop, at most once per interval for a given stream.
    fn reader_not_found(&self, stream_id: &str) {
        {
            let mut routes = self.routes();
            let now = std::time::Instant::now();
            if routes
                .not_found_sent
                .get(stream_id)
                .is_some_and(|last| now.duration_since(*last) < NOT_FOUND_INTERVAL)
            {
                return;
            }
            routes
                .not_found_sent
                .retain(|_, last| now.duration_since(*last) < NOT_FOUND_INTERVAL);
            routes.not_found_sent.insert(stream_id.to_string(), now);
        }
        tracing::debug!("data for unknown stream {}, canceling writer", stream_id);
        self.transport.send_ack(AckPacket {
            stream_id: stream_id.to_string(),
            acked_len: 0,
            fin: false,
            cancel: true,
            error: Some(READER_NOT_FOUND.to_string()),
        });
    }
}

async fn pump_packets(
    broker: Weak<Broker>,
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<Packet>,
) {
    while let Some(packet) = receiver.recv().await {
        let Some(broker) = broker.upgrade() else {
            break;
        };
        broker.dispatch(packet);
    }
    tracing::trace!("loopback pump done");
}
