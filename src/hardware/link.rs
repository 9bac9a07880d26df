//! Line-oriented links over any async byte stream.
//!
//! A [`StreamLink`] owns one connection at a time. Attaching a stream splits it
//! into a reader task and a writer task:
//!
//! - the writer drains an unbounded queue, so [`LineTransport::send`] never blocks
//!   the caller (the sequence controller);
//! - the reader turns incoming bytes into [`LinkEvent`]s and never touches
//!   controller state.
//!
//! The serial link is framed on `\n`; the vision link reads whatever chunk the
//! socket delivers and splits it on CR/LF, since the vision system does not
//! reliably terminate its replies.

use crate::error::{AppResult, PrealignError};
use crate::notify::{Direction, NotificationSink, SequenceEvent};
use crate::protocol::split_replies;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Longest serial line accepted; longer input is discarded up to the next newline.
pub const MAX_SERIAL_LINE_LEN: usize = 256;

/// Async byte stream usable as a link.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` qualifies:
/// `tokio_serial::SerialStream`, `tokio::net::TcpStream`, or
/// `tokio::io::DuplexStream` in tests.
pub trait LinkIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkIo for T {}

/// Type-erased link stream.
pub type DynLink = Box<dyn LinkIo>;

/// Which physical link a command travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// RS-232 link to the prealigner.
    Serial,
    /// TCP link to the vision system.
    Vision,
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Serial => write!(f, "Serial"),
            LinkKind::Vision => write!(f, "Vision"),
        }
    }
}

/// Input delivered by a link's reader task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One trimmed line from the prealigner.
    SerialLine(String),
    /// One trimmed reply from the vision system.
    VisionReply(String),
    /// The remote end closed the stream or a read failed.
    Closed(LinkKind),
}

/// Minimal outbound contract the controller depends on.
pub trait LineTransport: Send + Sync {
    /// Which link this is.
    fn kind(&self) -> LinkKind;

    /// Whether a connection is currently open.
    fn is_open(&self) -> bool;

    /// Queue bytes for transmission without blocking.
    ///
    /// Fails with [`PrealignError::TransportUnavailable`] when no connection is
    /// open; nothing is queued in that case.
    fn send(&self, bytes: Bytes) -> AppResult<()>;
}

struct Connection {
    label: String,
    writer_tx: mpsc::UnboundedSender<Bytes>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn shutdown(self) {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
    }
}

/// [`LineTransport`] backed by reader/writer tasks over an async stream.
pub struct StreamLink {
    kind: LinkKind,
    events: mpsc::UnboundedSender<LinkEvent>,
    sink: Arc<dyn NotificationSink>,
    connection: Mutex<Option<Connection>>,
}

impl StreamLink {
    /// Create a closed link that will deliver input to `events`.
    pub fn new(
        kind: LinkKind,
        events: mpsc::UnboundedSender<LinkEvent>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            kind,
            events,
            sink,
            connection: Mutex::new(None),
        }
    }

    /// Take ownership of an open stream, replacing any previous connection.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip_all, fields(link = %self.kind))]
    pub fn attach<S>(&self, io: S, label: impl Into<String>)
    where
        S: LinkIo + 'static,
    {
        let label = label.into();
        let previous = self.connection.lock().take();
        if let Some(previous) = previous {
            debug!(label = %previous.label, "Replacing existing connection");
            previous.shutdown();
        }

        let (read_half, write_half) = tokio::io::split(io);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let reader = match self.kind {
            LinkKind::Serial => tokio::spawn(read_serial_lines(
                read_half,
                self.events.clone(),
                self.sink.clone(),
                open.clone(),
            )),
            LinkKind::Vision => tokio::spawn(read_vision_replies(
                read_half,
                self.events.clone(),
                self.sink.clone(),
                open.clone(),
            )),
        };
        let writer = tokio::spawn(write_queued(self.kind, write_half, writer_rx, open.clone()));

        *self.connection.lock() = Some(Connection {
            label: label.clone(),
            writer_tx,
            open,
            reader,
            writer,
        });

        info!(%label, "Link connected");
        self.sink.notify(SequenceEvent::ConnectionStatus {
            link: self.kind,
            connected: true,
        });
    }

    /// Close the current connection, if any.
    pub fn detach(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            info!(link = %self.kind, label = %connection.label, "Link disconnected");
            connection.shutdown();
            self.sink.notify(SequenceEvent::ConnectionStatus {
                link: self.kind,
                connected: false,
            });
        }
    }

    /// Label of the open connection (port name or `host:port`).
    pub fn label(&self) -> Option<String> {
        self.connection
            .lock()
            .as_ref()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .map(|c| c.label.clone())
    }
}

impl LineTransport for StreamLink {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.open.load(Ordering::SeqCst))
    }

    fn send(&self, bytes: Bytes) -> AppResult<()> {
        let guard = self.connection.lock();
        let connection = guard
            .as_ref()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .ok_or(PrealignError::TransportUnavailable(self.kind))?;

        let text = String::from_utf8_lossy(&bytes).trim_end().to_string();
        connection
            .writer_tx
            .send(bytes)
            .map_err(|_| PrealignError::TransportUnavailable(self.kind))?;
        drop(guard);

        self.sink.log(self.kind.into(), Direction::Sent, text);
        Ok(())
    }
}

impl Drop for StreamLink {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.shutdown();
        }
    }
}

/// [`LineTransport`] that records what is sent instead of writing it.
///
/// Used to drive the controller without tasks or streams.
pub struct RecordingLink {
    kind: LinkKind,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl RecordingLink {
    /// Open recording link.
    pub fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Open or close the link.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Payloads sent so far, terminators stripped.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

impl LineTransport for RecordingLink {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, bytes: Bytes) -> AppResult<()> {
        if !self.is_open() {
            return Err(PrealignError::TransportUnavailable(self.kind));
        }
        self.sent
            .lock()
            .push(String::from_utf8_lossy(&bytes).trim_end().to_string());
        Ok(())
    }
}

async fn write_queued<W: AsyncWrite + Unpin>(
    kind: LinkKind,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    open: Arc<AtomicBool>,
) {
    while let Some(bytes) = queue.recv().await {
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(link = %kind, error = %e, "Write failed; closing link");
            open.store(false, Ordering::SeqCst);
            break;
        }
    }
}

fn link_closed(
    kind: LinkKind,
    events: &mpsc::UnboundedSender<LinkEvent>,
    sink: &Arc<dyn NotificationSink>,
    open: &AtomicBool,
) {
    // A detach already reported the closure.
    if open.swap(false, Ordering::SeqCst) {
        sink.notify(SequenceEvent::ConnectionStatus {
            link: kind,
            connected: false,
        });
        let _ = events.send(LinkEvent::Closed(kind));
    }
}

async fn read_serial_lines<R: AsyncRead + Unpin>(
    reader: R,
    events: mpsc::UnboundedSender<LinkEvent>,
    sink: Arc<dyn NotificationSink>,
    open: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(64);
    let mut overlong = false;
    loop {
        buf.clear();
        let limit = MAX_SERIAL_LINE_LEN as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!("Serial stream reached EOF");
                break;
            }
            Ok(_) => {
                let terminated = buf.last() == Some(&b'\n');
                if overlong || (!terminated && buf.len() > MAX_SERIAL_LINE_LEN) {
                    if !overlong {
                        warn!(limit = MAX_SERIAL_LINE_LEN, "Discarding over-long serial line");
                        sink.log(
                            LinkKind::Serial.into(),
                            Direction::Note,
                            format!("Discarded line longer than {MAX_SERIAL_LINE_LEN} bytes"),
                        );
                    }
                    overlong = !terminated;
                    continue;
                }
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                sink.log(LinkKind::Serial.into(), Direction::Received, line.clone());
                if events.send(LinkEvent::SerialLine(line)).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Serial read failed");
                break;
            }
        }
    }
    link_closed(LinkKind::Serial, &events, &sink, &open);
}

async fn read_vision_replies<R: AsyncRead + Unpin>(
    mut reader: R,
    events: mpsc::UnboundedSender<LinkEvent>,
    sink: Arc<dyn NotificationSink>,
    open: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Vision stream reached EOF");
                break;
            }
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                for reply in split_replies(&chunk) {
                    sink.log(LinkKind::Vision.into(), Direction::Received, reply.clone());
                    if events.send(LinkEvent::VisionReply(reply)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Vision read failed");
                break;
            }
        }
    }
    link_closed(LinkKind::Vision, &events, &sink, &open);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingSink;
    use crate::protocol::encode_raw;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn serial_link() -> (StreamLink, mpsc::UnboundedReceiver<LinkEvent>, Arc<RecordingSink>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink::new());
        (StreamLink::new(LinkKind::Serial, tx, sink.clone()), rx, sink)
    }

    #[test]
    fn send_without_connection_is_rejected() {
        let (link, _rx, sink) = serial_link();
        assert!(!link.is_open());
        let err = link.send(encode_raw("$2MTRSG100ALDD")).unwrap_err();
        assert!(matches!(err, PrealignError::TransportUnavailable(LinkKind::Serial)));
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn serial_lines_are_delivered_trimmed() {
        let (link, mut rx, _sink) = serial_link();
        let (mut device, host) = tokio::io::duplex(256);
        link.attach(host, "duplex");
        assert!(link.is_open());

        device.write_all(b"@2300000000015\r\n\r\n$23200000000MTRS5D\r\n").await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::SerialLine("@2300000000015".into())));
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::SerialLine("$23200000000MTRS5D".into()))
        );
    }

    #[tokio::test]
    async fn overlong_serial_line_is_discarded() {
        let (link, mut rx, sink) = serial_link();
        let (mut device, host) = tokio::io::duplex(4096);
        link.attach(host, "duplex");

        let noise = vec![b'7'; MAX_SERIAL_LINE_LEN * 3];
        device.write_all(&noise).await.unwrap();
        device.write_all(b"\r\n@2300000000015\r\n").await.unwrap();

        assert_eq!(rx.recv().await, Some(LinkEvent::SerialLine("@2300000000015".into())));
        assert_eq!(
            sink.count(|e| matches!(e, SequenceEvent::Log(entry) if entry.direction == Direction::Note)),
            1
        );
        assert!(link.is_open());
    }

    #[tokio::test]
    async fn sent_bytes_reach_the_stream() {
        let (link, _rx, sink) = serial_link();
        let (mut device, host) = tokio::io::duplex(256);
        link.attach(host, "duplex");

        link.send(encode_raw("$2CCLRE9B")).unwrap();
        let mut buf = [0u8; 11];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"$2CCLRE9B\r\n");
        assert_eq!(
            sink.count(|e| matches!(e, SequenceEvent::Log(entry) if entry.direction == Direction::Sent)),
            1
        );
    }

    #[tokio::test]
    async fn remote_close_reports_closed() {
        let (link, mut rx, sink) = serial_link();
        let (device, host) = tokio::io::duplex(64);
        link.attach(host, "duplex");
        drop(device);

        assert_eq!(rx.recv().await, Some(LinkEvent::Closed(LinkKind::Serial)));
        assert!(!link.is_open());
        assert_eq!(
            sink.non_log_events().last(),
            Some(&SequenceEvent::ConnectionStatus {
                link: LinkKind::Serial,
                connected: false
            })
        );
    }

    #[tokio::test]
    async fn vision_chunks_are_split() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = StreamLink::new(LinkKind::Vision, tx, Arc::new(RecordingSink::new()));
        let (mut camera, host) = tokio::io::duplex(64);
        link.attach(host, "127.0.0.1:8500");
        assert_eq!(link.label().as_deref(), Some("127.0.0.1:8500"));

        camera.write_all(b"T1\rER\r\n").await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::VisionReply("T1".into())));
        assert_eq!(rx.recv().await, Some(LinkEvent::VisionReply("ER".into())));
    }

    #[tokio::test]
    async fn detach_closes_without_closed_event() {
        let (link, mut rx, _sink) = serial_link();
        let (_device, host) = tokio::io::duplex(64);
        link.attach(host, "duplex");
        link.detach();
        assert!(!link.is_open());
        assert!(rx.try_recv().is_err());
    }
}
