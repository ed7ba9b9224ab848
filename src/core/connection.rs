/// Message-framed full-duplex connection
///
/// Wraps a raw stream in a pair of tasks: a reader that decodes inbound
/// frames onto a bounded queue, and a writer that drains a bounded queue
/// onto a buffered stream, flushing only once the queue runs dry so that
/// bursts coalesce without adding latency to an idle pipeline. The first
/// failure on either side wins the error cell; everything after it is
/// teardown.
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{PorteraError, PorteraResult};
use crate::protocol::{read_message, Message, Vocabulary};

/// Capacity of the inbound and outbound message queues.
const QUEUE_DEPTH: usize = 32;

struct Shared {
    err: OnceLock<PorteraError>,
}

impl Shared {
    fn record(&self, err: PorteraError) {
        let _ = self.err.set(err);
    }
}

/// A full-duplex message conduit over a TCP (or in-memory) stream.
pub struct FramedConnection {
    inbound: mpsc::Receiver<Message>,
    outbound: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    token: CancellationToken,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl FramedConnection {
    pub fn new<S>(stream: S, vocabulary: Vocabulary) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_token(stream, vocabulary, CancellationToken::new())
    }

    /// Build a framed connection whose close signal is the given token, so
    /// an external owner (the pool's in-flight registry) can tear the
    /// connection down remotely.
    pub fn with_token<S>(stream: S, vocabulary: Vocabulary, token: CancellationToken) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            err: OnceLock::new(),
        });

        let reader = tokio::spawn(read_loop(
            BufReader::new(read_half),
            vocabulary,
            inbound_tx,
            Arc::clone(&shared),
            token.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            BufWriter::new(write_half),
            outbound_rx,
            Arc::clone(&shared),
            token.clone(),
        ));

        Self {
            inbound: inbound_rx,
            outbound: outbound_tx,
            shared,
            token,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// Receive the next inbound message. `None` means the reader has
    /// stopped; consult [`error`](Self::error) to learn why.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// Queue a message for writing, in order.
    pub async fn send(&self, msg: Message) -> PorteraResult<()> {
        self.outbound.send(msg).await.map_err(|_| self.fault())
    }

    /// The first error observed by either side, if any.
    pub fn error(&self) -> Option<&PorteraError> {
        self.shared.err.get()
    }

    /// An owned copy of the first error, or `Eof` when the connection went
    /// down without recording one (remote close signal).
    pub fn fault(&self) -> PorteraError {
        match self.error() {
            Some(err) => copy_for_report(err),
            None => PorteraError::Eof,
        }
    }

    /// Signal both tasks to stop and wait for them to drain. Idempotent.
    pub async fn close(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.reader.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.writer.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for FramedConnection {
    fn drop(&mut self) {
        // A dropped connection must not leave its tasks parked on the socket.
        self.token.cancel();
    }
}

async fn read_loop<R>(
    mut reader: R,
    vocabulary: Vocabulary,
    inbound: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return,
            res = read_message(&mut reader, vocabulary) => match res {
                Ok(msg) => msg,
                Err(err) => {
                    shared.record(err);
                    return;
                }
            },
        };

        tokio::select! {
            _ = token.cancelled() => return,
            res = inbound.send(msg) => {
                if res.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: BufWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
    token: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return,
            maybe = outbound.recv() => match maybe {
                Some(msg) => msg,
                None => return,
            },
        };

        // Write, drain whatever queued up behind this message, then flush
        // once; a stalled peer must not outlive the close signal.
        let res = tokio::select! {
            _ = token.cancelled() => return,
            res = async {
                write_frame(&mut writer, &msg).await?;
                while let Ok(next) = outbound.try_recv() {
                    write_frame(&mut writer, &next).await?;
                }
                writer.flush().await
            } => res,
        };

        if let Err(err) = res {
            shared.record(err.into());
            return;
        }
    }
}

async fn write_frame<W>(writer: &mut BufWriter<W>, msg: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&msg.encode()).await
}

/// Produce an owned rendition of a stored error for reporting upward.
fn copy_for_report(err: &PorteraError) -> PorteraError {
    match err {
        PorteraError::ProtocolViolation => PorteraError::ProtocolViolation,
        PorteraError::UnknownMessage(tag) => PorteraError::UnknownMessage(*tag),
        PorteraError::UnsupportedAuthenticationRequest => {
            PorteraError::UnsupportedAuthenticationRequest
        }
        PorteraError::UnsupportedProtocol => PorteraError::UnsupportedProtocol,
        PorteraError::NoneAvailable => PorteraError::NoneAvailable,
        PorteraError::InvalidPassword => PorteraError::InvalidPassword,
        PorteraError::AuthenticationFailure => PorteraError::AuthenticationFailure,
        PorteraError::Eof => PorteraError::Eof,
        PorteraError::Io(io_err) => {
            PorteraError::Io(std::io::Error::new(io_err.kind(), io_err.to_string()))
        }
        other => PorteraError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AuthenticationRequest;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn query(text: &'static str) -> Message {
        Message::Other {
            tag: b'Q',
            body: Bytes::from_static(text.as_bytes()),
        }
    }

    #[tokio::test]
    async fn inbound_messages_arrive_in_wire_order() {
        let (near, mut far) = tokio::io::duplex(4096);
        let mut conn = FramedConnection::new(near, Vocabulary::Backend);

        let first = Message::Authentication(AuthenticationRequest::Ok);
        let second = Message::ReadyForQuery { status: b'I' };
        far.write_all(&first.encode()).await.unwrap();
        far.write_all(&second.encode()).await.unwrap();

        assert_eq!(conn.recv().await, Some(first));
        assert_eq!(conn.recv().await, Some(second));

        conn.close().await;
    }

    #[tokio::test]
    async fn outbound_bytes_match_the_queue_order() {
        let (near, mut far) = tokio::io::duplex(4096);
        let mut conn = FramedConnection::new(near, Vocabulary::Frontend);

        let messages = vec![
            query("SELECT 1"),
            query("SELECT 2"),
            Message::Other {
                tag: b'X',
                body: Bytes::new(),
            },
        ];
        let mut expected = Vec::new();
        for msg in &messages {
            expected.extend_from_slice(&msg.encode());
            conn.send(msg.clone()).await.unwrap();
        }

        let mut observed = vec![0u8; expected.len()];
        far.read_exact(&mut observed).await.unwrap();
        assert_eq!(observed, expected);

        conn.close().await;
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_clean_eof() {
        let (near, far) = tokio::io::duplex(4096);
        let mut conn = FramedConnection::new(near, Vocabulary::Backend);

        drop(far);

        assert_eq!(conn.recv().await, None);
        assert!(conn.error().is_some_and(|e| e.is_eof()));
        conn.close().await;
    }

    #[tokio::test]
    async fn decode_failure_records_first_error() {
        let (near, mut far) = tokio::io::duplex(4096);
        let mut conn = FramedConnection::new(near, Vocabulary::Backend);

        // 'Q' is not in the backend vocabulary.
        far.write_all(&query("SELECT 1").encode()).await.unwrap();

        assert_eq!(conn.recv().await, None);
        assert!(matches!(
            conn.error(),
            Some(PorteraError::UnknownMessage(b'Q'))
        ));
        conn.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (near, _far) = tokio::io::duplex(4096);
        let mut conn = FramedConnection::new(near, Vocabulary::Frontend);

        conn.close().await;
        conn.close().await;

        assert!(conn.send(query("SELECT 1")).await.is_err());
        assert_eq!(conn.recv().await, None);
    }
}
