use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::protocol::factory;
use crate::protocol::message::Message;
use crate::transport::{Received, Transport};

/// Stream transport client: one connected TCP socket, CRLF-delimited text
/// frames in both directions.
pub struct TcpClient {
    peer: SocketAddr,
    reader: Mutex<FrameReader>,
    writer: Mutex<OwnedWriteHalf>,
    stopped: AtomicBool,
    shutdown: Notify,
}

struct FrameReader {
    read_half: OwnedReadHalf,
    buffer: BytesMut,
}

impl Debug for TcpClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpClient{{peer:{}}}", self.peer)
    }
}

impl TcpClient {
    pub async fn connect(peer: SocketAddr) -> anyhow::Result<TcpClient> {
        let stream = TcpStream::connect(peer).await?;
        debug!(%peer, "connected");

        let (read_half, write_half) = stream.into_split();
        Ok(TcpClient {
            peer,
            reader: Mutex::new(FrameReader {
                read_half,
                buffer: BytesMut::new(),
            }),
            writer: Mutex::new(write_half),
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }
}

impl FrameReader {
    /// Splits off the first complete CRLF-terminated frame, keeping any bytes
    /// after it buffered for the next call.
    fn next_frame(&mut self) -> Option<BytesMut> {
        self.buffer
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| self.buffer.split_to(pos + 2))
    }
}

#[async_trait]
impl Transport for TcpClient {
    async fn send(&self, msg: Message) -> anyhow::Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            bail!("transport is stopped");
        }
        let data = msg.serialize();
        trace!(peer = %self.peer, frame = data.trim_end(), "sending frame");

        let mut writer = self.writer.lock().await;
        writer.write_all(data.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> anyhow::Result<Received> {
        let mut guard = self.reader.lock().await;
        let reader = &mut *guard;
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(Received::Closed);
            }

            if let Some(frame) = reader.next_frame() {
                let line = std::str::from_utf8(&frame)?;
                trace!(peer = %self.peer, frame = line.trim_end(), "received frame");
                return Ok(Received::Message(factory::parse_text(line)?));
            }

            let read = select! {
                _ = self.shutdown.notified() => return Ok(Received::Closed),
                read = reader.read_half.read_buf(&mut reader.buffer) => read,
            };
            match read {
                Ok(0) => {
                    debug!(peer = %self.peer, "peer closed the connection");
                    return Ok(Received::Closed);
                }
                Ok(_) => {}
                // a read failing while we are shutting down is an expected
                // race with the concurrent stop, not an error
                Err(_) if self.stopped.load(Ordering::Acquire) => return Ok(Received::Closed),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.peer, "stopping transport");
        self.shutdown.notify_one();
        let _ = self.writer.lock().await.shutdown().await;
    }
}
