//! Transport layer abstractions.
//!
//! The RPC core only needs an ordered, reliable stream of frames in each
//! direction. A [`Connection`] is split once into a [`FrameReader`] owned by
//! the receive loop and a [`FrameWriter`] owned by a dedicated writer task, so
//! sending never waits on receiving and vice versa.
//!
//! Two implementations ship with the crate: [`TcpConnection`] (length-prefixed
//! frames over TCP) and [`memory::pair`] (an in-process duplex link).

use crate::config::RpcConfig;
use crate::error::RpcError;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiving half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame from the peer.
    /// Returns `None` once the peer has closed the connection.
    ///
    /// An error of kind `InvalidData` means a single frame was discarded and
    /// the stream can still be read; any other error is fatal.
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Sending half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one frame to the peer.
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Close the sending direction gracefully.
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// A duplex, ordered, reliable frame stream to a single peer.
pub trait Connection: Send {
    /// Human-readable address of the peer, used for logging.
    fn remote_addr(&self) -> String;

    /// Split into independently owned read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>);
}

/// TCP connection carrying length-prefixed frames.
///
/// Each frame is a 4-byte big-endian length followed by the payload.
pub struct TcpConnection {
    stream: TcpStream,
    addr: SocketAddr,
    max_frame_size: usize,
}

impl TcpConnection {
    /// Wrap an accepted or connected stream.
    pub fn new(stream: TcpStream, addr: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            stream,
            addr,
            max_frame_size,
        }
    }

    /// Open a connection to `address`, honouring the configured connect timeout.
    pub async fn connect(address: &str, config: &RpcConfig) -> Result<Self, RpcError> {
        let timeout = config.connect_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(RpcError::ConnectionRefused {
                    address: address.to_string(),
                    source: e,
                })
            }
            Ok(Err(e)) => return Err(RpcError::Transport(e)),
            Err(_) => {
                return Err(RpcError::ConnectTimeout {
                    address: address.to_string(),
                    timeout,
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }
        let addr = stream.peer_addr()?;
        Ok(Self::new(stream, addr, config.max_frame_size))
    }
}

impl Connection for TcpConnection {
    fn remote_addr(&self) -> String {
        self.addr.to_string()
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let this = *self;
        let (read_half, write_half) = this.stream.into_split();
        (
            Box::new(TcpFrameReader {
                half: read_half,
                max_frame_size: this.max_frame_size,
            }),
            Box::new(TcpFrameWriter {
                half: write_half,
                max_frame_size: this.max_frame_size,
            }),
        )
    }
}

struct TcpFrameReader {
    half: OwnedReadHalf,
    max_frame_size: usize,
}

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        match self.half.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_frame_size {
            // Skip the payload so the next frame starts on a boundary.
            let mut payload = (&mut self.half).take(len as u64);
            tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit of {}", self.max_frame_size),
            ));
        }

        let mut data = vec![0u8; len];
        self.half.read_exact(&mut data).await?;
        Ok(Some(data))
    }
}

struct TcpFrameWriter {
    half: OwnedWriteHalf,
    max_frame_size: usize,
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if frame.len() > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds limit of {}",
                    frame.len(),
                    self.max_frame_size
                ),
            ));
        }

        let mut buf = Vec::with_capacity(frame.len() + 4);
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
        self.half.write_all(&buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.half.shutdown().await
    }
}

/// In-process connections for tests and same-process peers.
pub mod memory {
    use super::*;

    /// One end of an in-memory duplex link created by [`pair`].
    ///
    /// `remote_addr()` names the opposite end (`memory:a` or `memory:b`).
    pub struct MemoryConnection {
        label: String,
        sender: mpsc::UnboundedSender<Vec<u8>>,
        receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    /// Create two connected endpoints. Frames written on one are read on the
    /// other, in order.
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryConnection {
                label: "memory:b".to_string(),
                sender: a_tx,
                receiver: b_rx,
            },
            MemoryConnection {
                label: "memory:a".to_string(),
                sender: b_tx,
                receiver: a_rx,
            },
        )
    }

    impl Connection for MemoryConnection {
        fn remote_addr(&self) -> String {
            self.label.clone()
        }

        fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
            let this = *self;
            (
                Box::new(MemoryFrameReader {
                    receiver: this.receiver,
                }),
                Box::new(MemoryFrameWriter {
                    sender: Some(this.sender),
                }),
            )
        }
    }

    struct MemoryFrameReader {
        receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    #[async_trait]
    impl FrameReader for MemoryFrameReader {
        async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
            Ok(self.receiver.recv().await)
        }
    }

    struct MemoryFrameWriter {
        sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    }

    #[async_trait]
    impl FrameWriter for MemoryFrameWriter {
        async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            let sender = self
                .sender
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "writer shut down"))?;
            sender
                .send(frame.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer disconnected"))
        }

        async fn shutdown(&mut self) -> io::Result<()> {
            // Dropping the only sender ends the peer's read loop.
            self.sender.take();
            Ok(())
        }
    }
}

/// Spawn the task that owns a connection's write half.
///
/// Frames pushed into the returned queue are written in order. A frame the
/// writer rejects as `InvalidInput` is dropped on its own; the task exits and
/// shuts the writer down once every queue sender has been dropped or any
/// other write fails.
pub(crate) fn spawn_writer(
    mut writer: Box<dyn FrameWriter>,
    peer: String,
) -> (mpsc::UnboundedSender<Vec<u8>>, JoinHandle<()>) {
    let (sender, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
    let task = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            match writer.write_frame(&frame).await {
                Ok(()) => {}
                // Rejected before anything reached the socket.
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                    warn!("Dropped frame for {}: {}", peer, e);
                }
                Err(e) => {
                    warn!("Failed to write frame to {}: {}", peer, e);
                    break;
                }
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Writer shutdown for {} failed: {}", peer, e);
        }
    });
    (sender, task)
}
