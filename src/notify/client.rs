//! Client for notifying the sfdroid renderer of component lifecycle events

use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::error::{NotifyError, WriteStage};
use super::protocol::{Frame, NotifyKind, MAX_PAYLOAD};
use crate::config::Config;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Opens the transport a [`NotificationClient`] writes frames to
pub trait Connector {
    type Stream: Write;

    /// Path of the peer, used in error reports
    fn path(&self) -> &Path;

    /// Open a fresh connection to the peer
    fn connect(&self) -> io::Result<Self::Stream>;
}

/// Connects to the renderer's Unix domain socket
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
    write_timeout: Option<Duration>,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_timeout: None,
        }
    }

    /// Bound each blocking write; `None` blocks until the peer drains
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

impl Connector for UnixConnector {
    type Stream = SocketStream;

    fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> io::Result<SocketStream> {
        let stream = UnixStream::connect(&self.path)?;
        if self.write_timeout.is_some() {
            stream.set_write_timeout(self.write_timeout)?;
        }
        #[cfg(target_vendor = "apple")]
        suppress_sigpipe(&stream)?;
        Ok(SocketStream(stream))
    }
}

/// Unix stream whose writes never raise SIGPIPE
///
/// A vanished peer shows up as `EPIPE` from `write` instead of killing the
/// host process, without touching the process-wide signal disposition.
/// This holds on Linux and Android (`MSG_NOSIGNAL`) and on Apple targets
/// (`SO_NOSIGPIPE`). Other unix targets get neither, so a host that does not
/// ignore SIGPIPE itself can still be killed by a vanished peer.
#[derive(Debug)]
pub struct SocketStream(UnixStream);

impl Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: the fd is owned by self.0 and buf is valid for buf.len() bytes
        let sent = unsafe {
            libc::send(
                self.0.as_raw_fd(),
                buf.as_ptr().cast::<libc::c_void>(),
                buf.len(),
                SEND_FLAGS,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(target_vendor = "apple")]
fn suppress_sigpipe(stream: &UnixStream) -> io::Result<()> {
    let set: libc::c_int = 1;
    // SAFETY: the option value points at a live c_int of the advertised size
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&set as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Persistent, lazily (re)connecting notification channel
///
/// The connection is opened on first use and kept for later calls. Any write
/// failure closes it, and the next call opens a new one. Delivery is best
/// effort: failures are logged and returned, never retried within a call.
pub struct NotificationClient<C: Connector = UnixConnector> {
    connector: C,
    max_payload: usize,
    stream: Option<C::Stream>,
}

impl NotificationClient<UnixConnector> {
    /// Client for the socket at `socket_path` with default limits
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self::with_connector(UnixConnector::new(socket_path), MAX_PAYLOAD)
    }

    pub fn from_config(config: &Config) -> Self {
        let connector =
            UnixConnector::new(&config.socket_path).with_write_timeout(config.write_timeout());
        Self::with_connector(connector, config.max_payload)
    }
}

impl<C: Connector> NotificationClient<C> {
    pub fn with_connector(connector: C, max_payload: usize) -> Self {
        Self {
            connector,
            max_payload,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the current connection; the next call reconnects
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Disconnected from {}", self.connector.path().display());
        }
    }

    /// Tell the renderer that `component` started
    pub fn notify_start(&mut self, component: &str) -> Result<(), NotifyError> {
        self.notify(NotifyKind::Start, component)
    }

    /// Tell the renderer that `component` closed
    pub fn notify_close(&mut self, component: &str) -> Result<(), NotifyError> {
        self.notify(NotifyKind::Close, component)
    }

    pub fn notify(&mut self, kind: NotifyKind, component: &str) -> Result<(), NotifyError> {
        let frame = Frame::new(kind, component, self.max_payload).map_err(|e| {
            tracing::error!("Not sending {:?} notification: {}", kind, e);
            e
        })?;

        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect()?,
        };

        match write_frame(&mut stream, &frame) {
            Ok(()) => {
                tracing::trace!("Sent {:?} notification for {}", kind, component);
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                // stream is dropped here, closing the socket
                tracing::error!("{}", e);
                Err(e)
            }
        }
    }

    fn connect(&self) -> Result<C::Stream, NotifyError> {
        let path = self.connector.path();
        match self.connector.connect() {
            Ok(stream) => {
                tracing::debug!("Connected to renderer at {}", path.display());
                Ok(stream)
            }
            Err(source) => {
                let err = NotifyError::Connect {
                    path: path.to_path_buf(),
                    source,
                };
                tracing::error!("{}", err);
                Err(err)
            }
        }
    }
}

fn write_frame<W: Write>(stream: &mut W, frame: &Frame) -> Result<(), NotifyError> {
    stream
        .write_all(&frame.length_prefix())
        .map_err(|source| NotifyError::Write {
            stage: WriteStage::Length,
            source,
        })?;
    stream
        .write_all(frame.payload())
        .and_then(|()| stream.flush())
        .map_err(|source| NotifyError::Write {
            stage: WriteStage::Payload,
            source,
        })
}

/// [`NotificationClient`] behind a lock, for callers on several threads
///
/// The lock spans connect, both writes and teardown, so frames from
/// concurrent callers never interleave on the socket.
pub struct SharedClient<C: Connector = UnixConnector> {
    inner: Mutex<NotificationClient<C>>,
}

impl<C: Connector> SharedClient<C> {
    pub fn new(client: NotificationClient<C>) -> Self {
        Self {
            inner: Mutex::new(client),
        }
    }

    pub fn notify_start(&self, component: &str) -> Result<(), NotifyError> {
        self.lock().notify_start(component)
    }

    pub fn notify_close(&self, component: &str) -> Result<(), NotifyError> {
        self.lock().notify_close(component)
    }

    pub fn notify(&self, kind: NotifyKind, component: &str) -> Result<(), NotifyError> {
        self.lock().notify(kind, component)
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_connected()
    }

    fn lock(&self) -> MutexGuard<'_, NotificationClient<C>> {
        // the guarded state is only an optional socket, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Send a single notification over a fresh connection
///
/// # Arguments
/// * `config` - Socket path and limits to use
/// * `kind` - Start or close
/// * `component` - Component name to report
///
/// # Returns
/// Ok(()) once the frame is written; the connection is closed afterwards
pub fn send_notification(
    config: &Config,
    kind: NotifyKind,
    component: &str,
) -> Result<(), NotifyError> {
    NotificationClient::from_config(config).notify(kind, component)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn read_frame(stream: &mut UnixStream) -> Vec<u8> {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).unwrap();
        let len = u16::from_ne_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Trace {
        Connect,
        Write,
        Close,
    }

    /// In-memory transport that records what the client does with it
    #[derive(Clone, Default)]
    struct MockConnector {
        path: PathBuf,
        trace: Arc<Mutex<Vec<Trace>>>,
        refuse: Arc<AtomicBool>,
        fail_writes: Arc<AtomicBool>,
        open: Arc<AtomicUsize>,
    }

    impl MockConnector {
        fn trace(&self) -> Vec<Trace> {
            self.trace.lock().unwrap().clone()
        }

        fn connects(&self) -> usize {
            self.trace().iter().filter(|t| **t == Trace::Connect).count()
        }
    }

    struct MockStream {
        owner: MockConnector,
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.owner.fail_writes.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.owner.trace.lock().unwrap().push(Trace::Write);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for MockStream {
        fn drop(&mut self) {
            self.owner.open.fetch_sub(1, Ordering::SeqCst);
            self.owner.trace.lock().unwrap().push(Trace::Close);
        }
    }

    impl Connector for MockConnector {
        type Stream = MockStream;

        fn path(&self) -> &Path {
            &self.path
        }

        fn connect(&self) -> io::Result<MockStream> {
            self.trace.lock().unwrap().push(Trace::Connect);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(MockStream {
                owner: self.clone(),
            })
        }
    }

    #[test]
    fn test_notify_start_over_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("app_helpers_handle");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_frame(&mut stream)
        });

        let mut client = NotificationClient::new(&socket_path);
        client.notify_start("com.example.App").unwrap();
        assert!(client.is_connected());

        assert_eq!(handle.join().unwrap(), b"com.example.App\0");
    }

    #[test]
    fn test_connection_is_reused() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("app_helpers_handle");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let first = read_frame(&mut stream);
            let second = read_frame(&mut stream);
            (first, second)
        });

        let mut client = NotificationClient::new(&socket_path);
        client.notify_start("com.example.App").unwrap();
        client.notify_close("com.example.App").unwrap();

        let (first, second) = handle.join().unwrap();
        assert_eq!(first, b"com.example.App\0");
        assert_eq!(second, b"close:com.example.App\0");
    }

    #[test]
    fn test_reconnects_after_peer_goes_away() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("app_helpers_handle");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let mut client = NotificationClient::new(&socket_path);

        // first peer connection reads one frame and hangs up
        let (mut peer, _) = {
            client.notify_start("com.example.First").unwrap();
            listener.accept().unwrap()
        };
        assert_eq!(read_frame(&mut peer), b"com.example.First\0");
        drop(peer);

        let err = client.notify_start("com.example.Lost").unwrap_err();
        assert!(matches!(
            err,
            NotifyError::Write {
                stage: WriteStage::Length,
                ..
            }
        ));
        assert!(!client.is_connected());

        client.notify_close("com.example.First").unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(read_frame(&mut peer), b"close:com.example.First\0");
    }

    #[test]
    fn test_write_failure_closes_before_reconnect() {
        let connector = MockConnector::default();
        let mut client = NotificationClient::with_connector(connector.clone(), MAX_PAYLOAD);

        client.notify_start("com.example.App").unwrap();
        assert_eq!(connector.connects(), 1);

        connector.fail_writes.store(true, Ordering::SeqCst);
        assert!(client.notify_start("com.example.App").is_err());
        assert!(!client.is_connected());
        assert_eq!(connector.open.load(Ordering::SeqCst), 0);
        // no reconnect within the failing call
        assert_eq!(connector.connects(), 1);

        connector.fail_writes.store(false, Ordering::SeqCst);
        client.notify_close("com.example.App").unwrap();
        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.open.load(Ordering::SeqCst), 1);

        // old stream closed, then exactly one connect, then the writes
        let trace = connector.trace();
        let tail = &trace[trace.len() - 4..];
        assert_eq!(
            tail,
            &[Trace::Close, Trace::Connect, Trace::Write, Trace::Write]
        );
    }

    #[test]
    fn test_unreachable_peer_is_best_effort() {
        let connector = MockConnector::default();
        connector.refuse.store(true, Ordering::SeqCst);
        let mut client = NotificationClient::with_connector(connector.clone(), MAX_PAYLOAD);

        for _ in 0..3 {
            let err = client.notify_start("com.example.App").unwrap_err();
            assert!(matches!(err, NotifyError::Connect { .. }));
            assert!(!client.is_connected());
        }
        assert_eq!(connector.connects(), 3);
    }

    #[test]
    fn test_missing_socket_reports_path() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("absent");

        let mut client = NotificationClient::new(&socket_path);
        let err = client.notify_close("com.example.App").unwrap_err();
        match err {
            NotifyError::Connect { path, .. } => assert_eq!(path, socket_path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rejected_input_skips_io() {
        let connector = MockConnector::default();
        let mut client = NotificationClient::with_connector(connector.clone(), 32);

        assert!(matches!(
            client.notify_start(""),
            Err(NotifyError::InvalidComponent(_))
        ));
        assert_eq!(connector.connects(), 0);

        client.notify_start("com.example.App").unwrap();
        let long = "x".repeat(40);
        assert!(matches!(
            client.notify_close(&long),
            Err(NotifyError::PayloadTooLarge { len: 47, max: 32 })
        ));
        // a rejected frame leaves the live connection alone
        assert!(client.is_connected());
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn test_disconnect_forces_reconnect() {
        let connector = MockConnector::default();
        let mut client = NotificationClient::with_connector(connector.clone(), MAX_PAYLOAD);

        client.notify_start("a").unwrap();
        client.disconnect();
        assert!(!client.is_connected());
        client.notify_start("b").unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[test]
    fn test_shared_client_keeps_frames_whole() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("app_helpers_handle");
        let listener = UnixListener::bind(&socket_path).unwrap();

        const PER_THREAD: usize = 50;
        let reader = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            (0..PER_THREAD * 2)
                .map(|_| read_frame(&mut stream))
                .collect::<Vec<_>>()
        });

        let shared = Arc::new(SharedClient::new(NotificationClient::new(&socket_path)));
        let writers: Vec<_> = ["com.example.Alpha", "com.example.Beta"]
            .into_iter()
            .map(|name| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        shared.notify_start(name).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let frames = reader.join().unwrap();
        assert_eq!(frames.len(), PER_THREAD * 2);
        for frame in frames {
            assert!(frame == b"com.example.Alpha\0" || frame == b"com.example.Beta\0");
        }
        assert!(shared.is_connected());
    }

    #[test]
    fn test_write_timeout_tears_down_stalled_connection() {
        let dir = tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("app_helpers_handle"),
            write_timeout_secs: Some(1),
            ..Config::default()
        };
        // accepted but never read, so the socket buffer eventually fills
        let listener = UnixListener::bind(&config.socket_path).unwrap();

        let mut client = NotificationClient::from_config(&config);
        let name = "x".repeat(5000);
        let mut err = None;
        for _ in 0..10_000 {
            if let Err(e) = client.notify_start(&name) {
                err = Some(e);
                break;
            }
        }

        assert!(matches!(err, Some(NotifyError::Write { .. })));
        assert!(!client.is_connected());
        drop(listener);
    }

    #[test]
    fn test_send_notification_one_shot() {
        let dir = tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("app_helpers_handle"),
            ..Config::default()
        };
        let listener = UnixListener::bind(&config.socket_path).unwrap();

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let frame = read_frame(&mut stream);
            // the one-shot client hangs up after its frame
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).unwrap();
            (frame, rest)
        });

        send_notification(&config, NotifyKind::Close, "com.example.App").unwrap();

        let (frame, rest) = handle.join().unwrap();
        assert_eq!(frame, b"close:com.example.App\0");
        assert!(rest.is_empty());
    }
}
