//! TCP transport: a tokio backed [`IoEngine`] plus listen and connect helpers.
//!
//! Each registered socket is split into owned halves. Writes run as one task
//! per registration and report progress after every partial write. Reads run
//! as a single task per socket, gated by a watch channel so the connection
//! can pause the socket while an inline bulk stream is backed up.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::io::{IoEngine, IoHandle, ReadCallback, ReadEvent, WriteCallback};
use crate::registry::Registry;

/// Bytes requested from the socket per read
const READ_CHUNK: usize = 16 * 1024;

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadGate {
    Open,
    Paused,
    Closed,
}

async fn until_closed(gate: &mut watch::Receiver<ReadGate>) {
    while *gate.borrow_and_update() != ReadGate::Closed {
        if gate.changed().await.is_err() {
            return;
        }
    }
}

struct Socket {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    gate: watch::Sender<ReadGate>,
}

/// [`IoEngine`] over tokio TCP streams
pub struct TokioIoEngine {
    runtime: Handle,
    next_handle: AtomicU64,
    sockets: Registry<IoHandle, Arc<Socket>>,
}

impl fmt::Debug for TokioIoEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioIoEngine")
            .field("sockets", &self.sockets.len())
            .finish()
    }
}

impl TokioIoEngine {
    /// Create an engine spawning its tasks on `runtime`
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            next_handle: AtomicU64::new(1),
            sockets: Registry::new(),
        })
    }

    /// Take over `stream` and return its handle
    pub fn register(&self, stream: TcpStream) -> IoHandle {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "cannot disable nagle");
        }
        let handle = IoHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (reader, writer) = stream.into_split();
        let (gate, _) = watch::channel(ReadGate::Open);
        self.sockets.insert(
            handle,
            Arc::new(Socket {
                reader: Mutex::new(Some(reader)),
                writer: Arc::new(tokio::sync::Mutex::new(Some(writer))),
                gate,
            }),
        );
        trace!(%handle, "socket registered");
        handle
    }

    /// Sockets currently open
    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }

    fn socket(&self, handle: IoHandle) -> Result<Arc<Socket>, TransportError> {
        self.sockets
            .lookup(&handle)
            .ok_or_else(|| TransportError::Io(format!("{handle} is not open")))
    }
}

impl IoEngine for TokioIoEngine {
    fn register_for_write(
        &self,
        handle: IoHandle,
        bytes: Bytes,
        mut on_progress: WriteCallback,
    ) -> Result<(), TransportError> {
        let socket = self.socket(handle)?;
        let writer = socket.writer.clone();
        let mut closed = socket.gate.subscribe();
        self.runtime.spawn(async move {
            let mut guard = writer.lock().await;
            let Some(stream) = guard.as_mut() else {
                drop(guard);
                on_progress(0, true);
                return;
            };
            let mut sent = 0;
            while sent < bytes.len() {
                let written = tokio::select! {
                    result = stream.write(&bytes[sent..]) => result,
                    _ = until_closed(&mut closed) => break,
                };
                match written {
                    Ok(0) => break,
                    Ok(n) => {
                        sent += n;
                        if sent < bytes.len() {
                            on_progress(sent, false);
                        }
                    }
                    Err(err) => {
                        debug!(%handle, error = %err, "write failed");
                        break;
                    }
                }
            }
            drop(guard);
            on_progress(sent, true);
        });
        Ok(())
    }

    fn register_for_read(
        &self,
        handle: IoHandle,
        mut on_data: ReadCallback,
    ) -> Result<(), TransportError> {
        let socket = self.socket(handle)?;
        let Some(mut reader) = socket.reader.lock().take() else {
            return Err(TransportError::Io(format!("{handle} already has a reader")));
        };
        let mut gate = socket.gate.subscribe();
        self.runtime.spawn(async move {
            loop {
                let state = *gate.borrow_and_update();
                match state {
                    ReadGate::Closed => break,
                    ReadGate::Paused => {
                        if gate.changed().await.is_err() {
                            break;
                        }
                        continue;
                    }
                    ReadGate::Open => {}
                }
                let mut buf = BytesMut::with_capacity(READ_CHUNK);
                tokio::select! {
                    changed = gate.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    result = reader.read_buf(&mut buf) => match result {
                        Ok(0) => {
                            on_data(ReadEvent::Closed(None));
                            break;
                        }
                        Ok(_) => on_data(ReadEvent::Data(buf.freeze())),
                        Err(err) => {
                            on_data(ReadEvent::Closed(Some(err.to_string())));
                            break;
                        }
                    },
                }
            }
            trace!(%handle, "read loop finished");
        });
        Ok(())
    }

    fn set_read_interest(&self, handle: IoHandle, interested: bool) {
        let Some(socket) = self.sockets.lookup(&handle) else {
            return;
        };
        let next = if interested {
            ReadGate::Open
        } else {
            ReadGate::Paused
        };
        socket.gate.send_if_modified(|gate| {
            if *gate == ReadGate::Closed || *gate == next {
                return false;
            }
            *gate = next;
            true
        });
    }

    fn close(&self, handle: IoHandle) {
        let Some(socket) = self.sockets.remove_if_present(&handle) else {
            return;
        };
        socket.gate.send_replace(ReadGate::Closed);
        let writer = socket.writer.clone();
        self.runtime.spawn(async move {
            if let Some(mut stream) = writer.lock().await.take() {
                if let Err(err) = stream.shutdown().await {
                    warn!(%handle, error = %err, "shutdown failed");
                }
            }
        });
        debug!(%handle, "socket closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    async fn pair(engine: &TokioIoEngine) -> (IoHandle, IoHandle) {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(connect_tcp(addr), listener.accept());
        let a = engine.register(client.unwrap());
        let b = engine.register(accepted.unwrap().0);
        (a, b)
    }

    fn write(engine: &TokioIoEngine, handle: IoHandle, bytes: &'static [u8]) -> oneshot::Receiver<usize> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        engine
            .register_for_write(
                handle,
                Bytes::from_static(bytes),
                Box::new(move |sent, finished| {
                    if finished {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(sent);
                        }
                    }
                }),
            )
            .unwrap();
        rx
    }

    fn reader(engine: &TokioIoEngine, handle: IoHandle) -> mpsc::UnboundedReceiver<ReadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        engine
            .register_for_read(
                handle,
                Box::new(move |event| {
                    let _ = tx.send(event);
                }),
            )
            .unwrap();
        rx
    }

    async fn read_exactly(rx: &mut mpsc::UnboundedReceiver<ReadEvent>, len: usize) -> Vec<u8> {
        let mut got = Vec::new();
        while got.len() < len {
            match rx.recv().await.unwrap() {
                ReadEvent::Data(data) => got.extend_from_slice(&data),
                other => panic!("unexpected {other:?}"),
            }
        }
        got
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_read_and_close() {
        let engine = TokioIoEngine::new(Handle::current());
        let (a, b) = pair(&engine).await;
        let mut rx = reader(&engine, b);

        assert_eq!(write(&engine, a, b"hello link").await.unwrap(), 10);
        assert_eq!(read_exactly(&mut rx, 10).await, b"hello link");

        engine.close(a);
        assert!(matches!(rx.recv().await.unwrap(), ReadEvent::Closed(_)));
        assert!(engine
            .register_for_write(a, Bytes::from_static(b"x"), Box::new(|_, _| {}))
            .is_err());
        assert_eq!(engine.open_sockets(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_paused_socket_delivers_after_resume() {
        let engine = TokioIoEngine::new(Handle::current());
        let (a, b) = pair(&engine).await;
        engine.set_read_interest(b, false);
        let mut rx = reader(&engine, b);

        assert_eq!(write(&engine, a, b"held").await.unwrap(), 4);
        let early = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(early.is_err());

        engine.set_read_interest(b, true);
        assert_eq!(read_exactly(&mut rx, 4).await, b"held");
    }

    #[tokio::test]
    async fn test_second_reader_is_rejected() {
        let engine = TokioIoEngine::new(Handle::current());
        let (_a, b) = pair(&engine).await;
        let _rx = reader(&engine, b);
        assert!(engine.register_for_read(b, Box::new(|_| {})).is_err());
    }
}
