//! Carries stream packets over a byte pipe such as a TCP connection or a child process' stdio.
//!
//! Packets are encoded with `bitcode` and framed with a length-delimited codec. Each side of the
//! pipe runs a [`Broker`]; a sender task drains the broker's outbound queue into the pipe and a
//! receiver task dispatches decoded packets back into the broker.

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::broker::Broker;
use crate::protocol::{ChannelTransport, Packet};

/// Framed send stream for length-delimited packets.
///
/// Generic over the underlying writer type - works with TCP, pipes, or any AsyncWrite.
#[derive(Debug)]
pub struct SendStream<W> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    /// Queues a packet without flushing.
    pub async fn feed_packet(&mut self, packet: &Packet) -> anyhow::Result<()> {
        let bytes = bitcode::serialize(packet)?;
        self.framed.feed(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn send_packet(&mut self, packet: &Packet) -> anyhow::Result<()> {
        self.feed_packet(packet).await?;
        SinkExt::<bytes::Bytes>::flush(&mut self.framed).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        SinkExt::<bytes::Bytes>::flush(&mut self.framed).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        SinkExt::<bytes::Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// Framed receive stream for length-delimited packets.
#[derive(Debug)]
pub struct RecvStream<R> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        let framed = tokio_util::codec::FramedRead::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    /// Returns the next packet, or `None` once the peer closed the pipe.
    pub async fn recv_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let packet = bitcode::deserialize(&bytes)?;
            Ok(Some(packet))
        } else {
            Ok(None)
        }
    }
}

/// Drains outbound packets into the pipe until the queue closes or `cancellation_token` fires.
pub async fn run_sender<W: AsyncWrite + Unpin>(
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<Packet>,
    mut send_stream: SendStream<W>,
    cancellation_token: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    while let Some(packet) = tokio::select! {
        packet = receiver.recv() => packet,
        _ = cancellation_token.cancelled() => None,
    } {
        send_stream.feed_packet(&packet).await?;
        // batch whatever is already queued before paying for a flush
        while let Ok(packet) = receiver.try_recv() {
            send_stream.feed_packet(&packet).await?;
        }
        send_stream.flush().await?;
    }
    tracing::debug!("packet sender done");
    send_stream.close().await
}

/// Dispatches inbound packets into `broker` until the peer closes the pipe.
pub async fn run_receiver<R: AsyncRead + Unpin>(
    mut recv_stream: RecvStream<R>,
    broker: std::sync::Arc<Broker>,
) -> anyhow::Result<()> {
    while let Some(packet) = recv_stream.recv_packet().await? {
        broker.dispatch(packet);
    }
    tracing::debug!("packet receiver done");
    Ok(())
}

/// Streams multiplexed over one byte pipe.
#[derive(Debug)]
pub struct WireSession {
    pub broker: std::sync::Arc<Broker>,
    cancellation_token: tokio_util::sync::CancellationToken,
    tasks: tokio::task::JoinSet<anyhow::Result<()>>,
}

impl WireSession {
    /// Starts the sender and receiver tasks for one end of the pipe.
    pub fn spawn<R, W>(read: R, write: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (transport, receiver) = ChannelTransport::new();
        let broker = Broker::new(std::sync::Arc::new(transport));
        let cancellation_token = tokio_util::sync::CancellationToken::new();
        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(run_sender(
            receiver,
            SendStream::new(write),
            cancellation_token.clone(),
        ));
        tasks.spawn(run_receiver(RecvStream::new(read), broker.clone()));
        Self {
            broker,
            cancellation_token,
            tasks,
        }
    }

    /// Stops sending, then waits for the peer to close its side of the pipe.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.cancellation_token.cancel();
        while let Some(result) = self.tasks.join_next().await {
            result??;
        }
        Ok(())
    }
}
