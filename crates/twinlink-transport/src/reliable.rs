use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use twinlink_frame::{decode_frame, Message};

use crate::error::{Result, TransportError};
use crate::traits::{Inbound, Origin};

/// Bytes requested from the stream per read.
pub const READ_CHUNK_SIZE: usize = 4096;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Resolves once when a [`ReliableChannel`] is disposed, whichever path
/// (peer close, read error, write error, explicit dispose) got there first.
#[derive(Debug)]
pub struct DisconnectSignal {
    remote: SocketAddr,
    rx: oneshot::Receiver<()>,
}

impl DisconnectSignal {
    /// Wait for the channel to disconnect and return its remote address.
    pub async fn wait(self) -> SocketAddr {
        // A dropped sender means the channel itself is gone.
        let _ = self.rx.await;
        self.remote
    }
}

/// One reliable full-duplex stream carrying frames in both directions.
///
/// Sends are serialized by an async lock held for the whole frame, so
/// concurrent senders never interleave bytes. Inbound bytes are accumulated
/// and split into frames regardless of how the stream chunks them.
pub struct ReliableChannel {
    remote: SocketAddr,
    reader: Mutex<Option<BoxedReader>>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    disconnect_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ReliableChannel {
    /// Wrap a connected TCP stream.
    pub fn new(stream: TcpStream) -> Result<(Arc<Self>, DisconnectSignal)> {
        let remote = stream.peer_addr()?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%remote, error = %err, "failed to disable nagle");
        }
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(reader, writer, remote))
    }

    /// Build a channel from arbitrary stream halves.
    pub fn from_parts<R, W>(reader: R, writer: W, remote: SocketAddr) -> (Arc<Self>, DisconnectSignal)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let channel = Arc::new(Self {
            remote,
            reader: Mutex::new(Some(Box::new(reader))),
            writer: AsyncMutex::new(Some(Box::new(writer))),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            disconnect_tx: Mutex::new(Some(tx)),
        });
        (channel, DisconnectSignal { remote, rx })
    }

    /// Remote address of the stream.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// False once the channel has been disposed.
    pub fn is_connected(&self) -> bool {
        !self.disposed.load(Ordering::Acquire)
    }

    /// Encode and write one complete frame.
    ///
    /// A write failure disposes the channel and is returned to the caller;
    /// it is never retried.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let bytes = message.encode()?;

        let outcome = {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(TransportError::Disconnected);
            };
            tokio::select! {
                _ = self.cancel.cancelled() => None,
                res = write_all_flush(writer, &bytes) => Some(res),
            }
        };

        match outcome {
            Some(Ok(())) => {
                trace!(remote = %self.remote, kind = message.kind(), size = bytes.len(), "sent frame");
                Ok(())
            }
            Some(Err(err)) => {
                warn!(remote = %self.remote, error = %err, "reliable write failed");
                self.dispose().await;
                Err(TransportError::Io(err))
            }
            None => Err(TransportError::Disconnected),
        }
    }

    /// Start the receive loop, delivering every complete frame to `inbound`.
    ///
    /// Returns false if the loop was already started or the channel is disposed.
    pub fn start_receiving(self: &Arc<Self>, inbound: Arc<dyn Inbound>) -> bool {
        let Some(reader) = lock(&self.reader).take() else {
            return false;
        };
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            channel.receive_loop(reader, inbound).await;
        });
        true
    }

    async fn receive_loop(self: Arc<Self>, mut reader: BoxedReader, inbound: Arc<dyn Inbound>) {
        let origin = Origin::reliable(self.remote);
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

        loop {
            buf.reserve(READ_CHUNK_SIZE);
            let read = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(remote = %self.remote, "reliable receive loop cancelled");
                    break;
                }
                read = reader.read_buf(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!(remote = %self.remote, "reliable stream closed by peer");
                    break;
                }
                Ok(n) => trace!(remote = %self.remote, bytes = n, buffered = buf.len(), "read chunk"),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(remote = %self.remote, error = %err, "reliable stream read failed");
                    break;
                }
            }

            loop {
                match decode_frame(&mut buf) {
                    Ok(Some(frame)) => inbound.deliver(frame, origin),
                    Ok(None) => break,
                    Err(err) => warn!(remote = %self.remote, error = %err, "dropping malformed frame"),
                }
            }
        }

        drop(reader);
        self.dispose().await;
    }

    /// Stop the receive loop without waiting for it; the loop disposes the
    /// channel on its way out. For callers that cannot await [`dispose`](Self::dispose).
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Close the stream, stop the receive loop, and fire the disconnect signal.
    ///
    /// Idempotent: only the first call has any effect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let reader = lock(&self.reader).take();
        drop(reader);

        let tx = lock(&self.disconnect_tx).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!(remote = %self.remote, error = %err, "stream shutdown failed");
            }
        }

        info!(remote = %self.remote, "reliable channel disposed");
    }
}

impl std::fmt::Debug for ReliableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableChannel")
            .field("remote", &self.remote)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn write_all_flush(writer: &mut BoxedWriter, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{duplex, split, DuplexStream, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use twinlink_frame::{Frame, PeerBind};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn channel_over(stream: DuplexStream) -> (Arc<ReliableChannel>, DisconnectSignal) {
        let (reader, writer) = split(stream);
        ReliableChannel::from_parts(reader, writer, test_addr())
    }

    fn collector() -> (Arc<dyn Inbound>, mpsc::UnboundedReceiver<(Frame, Origin)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound: Arc<dyn Inbound> = Arc::new(move |frame: Frame, origin: Origin| {
            let _ = tx.send((frame, origin));
        });
        (inbound, rx)
    }

    async fn recv_frames(
        rx: &mut mpsc::UnboundedReceiver<(Frame, Origin)>,
        count: usize,
    ) -> Vec<Message> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let (frame, _) = timeout(WAIT, rx.recv())
                .await
                .expect("frame should arrive")
                .expect("collector should stay open");
            out.push(Message::from_frame(frame).unwrap());
        }
        out
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::text("hello"),
            Message::IdentityAssignment(7),
            Message::PeerBind(PeerBind::request(7)),
            Message::text(""),
            Message::Raw(Frame::new(99, vec![1, 2, 3, 4, 5, 6, 7, 8, 9])),
            Message::text("x".repeat(5000)),
            Message::PeerBind(PeerBind::ack(7)),
        ]
    }

    #[tokio::test]
    async fn send_and_receive_between_channels() {
        let (left, right) = duplex(64 * 1024);
        let (sender, _sender_signal) = channel_over(left);
        let (receiver, _receiver_signal) = channel_over(right);
        let (inbound, mut rx) = collector();
        assert!(receiver.start_receiving(inbound));

        for message in sample_messages() {
            sender.send(&message).await.unwrap();
        }

        let received = recv_frames(&mut rx, sample_messages().len()).await;
        assert_eq!(received, sample_messages());
    }

    #[tokio::test]
    async fn arbitrary_chunking_yields_same_messages() {
        let mut wire = Vec::new();
        for message in sample_messages() {
            wire.extend_from_slice(&message.encode().unwrap());
        }

        for chunk_size in [1usize, 2, 3, 5, 7, 64, 4095, 4097, wire.len()] {
            let (mut raw, stream) = duplex(1024 * 1024);
            let (channel, _signal) = channel_over(stream);
            let (inbound, mut rx) = collector();
            channel.start_receiving(inbound);

            for chunk in wire.chunks(chunk_size) {
                raw.write_all(chunk).await.unwrap();
                raw.flush().await.unwrap();
            }

            let received = recv_frames(&mut rx, sample_messages().len()).await;
            assert_eq!(received, sample_messages(), "chunk size {chunk_size}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_do_not_interleave() {
        const SENDERS: usize = 128;

        let (stream, mut raw) = duplex(8 * 1024);
        let (channel, _signal) = channel_over(stream);

        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            while frames.len() < SENDERS {
                let n = raw.read_buf(&mut buf).await.unwrap();
                assert!(n > 0, "stream closed early");
                while let Some(frame) = decode_frame(&mut buf).unwrap() {
                    frames.push(frame);
                }
            }
            frames
        });

        let mut tasks = Vec::new();
        for i in 0..SENDERS {
            let channel = Arc::clone(&channel);
            tasks.push(tokio::spawn(async move {
                let body = format!("sender-{i}-{}", "#".repeat(i * 7));
                channel.send(&Message::text(body)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let frames = timeout(WAIT, reader).await.unwrap().unwrap();
        let texts: BTreeSet<String> = frames
            .into_iter()
            .map(|frame| match Message::from_frame(frame).unwrap() {
                Message::Text(text) => text,
                other => panic!("unexpected message {other:?}"),
            })
            .collect();
        let expected: BTreeSet<String> = (0..SENDERS)
            .map(|i| format!("sender-{i}-{}", "#".repeat(i * 7)))
            .collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn malformed_frame_does_not_close_channel() {
        let (mut raw, stream) = duplex(4096);
        let (channel, _signal) = channel_over(stream);
        let (inbound, mut rx) = collector();
        channel.start_receiving(inbound);

        raw.write_all(&[0x00, 0x00]).await.unwrap();
        raw.write_all(&Message::text("after").encode().unwrap())
            .await
            .unwrap();

        let received = recv_frames(&mut rx, 1).await;
        assert_eq!(received, vec![Message::text("after")]);
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn peer_close_fires_disconnect_once() {
        let (raw, stream) = duplex(4096);
        let (channel, signal) = channel_over(stream);
        let (inbound, _rx) = collector();
        channel.start_receiving(inbound);

        drop(raw);
        let remote = timeout(WAIT, signal.wait()).await.unwrap();
        assert_eq!(remote, test_addr());
        assert!(!channel.is_connected());

        channel.dispose().await;
        channel.dispose().await;
        assert!(matches!(
            channel.send(&Message::text("late")).await,
            Err(TransportError::Disconnected)
        ));
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    #[tokio::test]
    async fn read_error_then_explicit_dispose_fires_once() {
        let (_raw, stream) = duplex(4096);
        let (channel, signal) = ReliableChannel::from_parts(FailingReader, stream, test_addr());
        let (inbound, _rx) = collector();
        channel.start_receiving(inbound);

        timeout(WAIT, signal.wait()).await.unwrap();
        channel.dispose().await;
        assert!(!channel.is_connected());
        assert!(!channel.start_receiving(collector().0));
    }

    #[tokio::test]
    async fn dispose_cancels_receive_loop_and_closes_stream() {
        let (mut raw, stream) = duplex(4096);
        let (channel, signal) = channel_over(stream);
        let (inbound, _rx) = collector();
        channel.start_receiving(inbound);

        channel.dispose().await;
        timeout(WAIT, signal.wait()).await.unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0, "peer should observe end of stream");
    }

    #[tokio::test]
    async fn abort_disposes_through_the_receive_loop() {
        let (mut raw, stream) = duplex(4096);
        let (channel, signal) = channel_over(stream);
        let (inbound, _rx) = collector();
        channel.start_receiving(inbound);

        channel.abort();
        timeout(WAIT, signal.wait()).await.unwrap();
        assert!(!channel.is_connected());

        let mut buf = [0u8; 16];
        let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn start_receiving_is_idempotent() {
        let (_raw, stream) = duplex(4096);
        let (channel, _signal) = channel_over(stream);
        assert!(channel.start_receiving(collector().0));
        assert!(!channel.start_receiving(collector().0));
    }

    #[tokio::test]
    async fn tcp_roundtrip_reports_remote_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client_stream, accepted) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let client_stream = client_stream.unwrap();
        let (server_stream, peer) = accepted.unwrap();

        let (client, _client_signal) = ReliableChannel::new(client_stream).unwrap();
        let (server, server_signal) = ReliableChannel::new(server_stream).unwrap();
        assert_eq!(server.remote_addr(), peer);
        assert_eq!(client.remote_addr(), addr);

        let (inbound, mut rx) = collector();
        server.start_receiving(inbound);
        client.send(&Message::text("over tcp")).await.unwrap();

        let (frame, origin) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(Message::from_frame(frame).unwrap(), Message::text("over tcp"));
        assert_eq!(origin, Origin::reliable(peer));

        client.dispose().await;
        timeout(WAIT, server_signal.wait()).await.unwrap();
        assert!(!server.is_connected());
    }
}
