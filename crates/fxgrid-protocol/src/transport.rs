//! Control channel transport between a sandbox master and its child.
//!
//! Frames are a big-endian u32 length followed by the bincode body. The
//! transport is generic over the byte stream so it runs over loopback TCP in
//! production and over in-memory pipes in tests.

use crate::error::{GridError, Result};
use crate::protocol::{MasterMessage, SlaveMessage, MAX_FRAME_LEN};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

pub struct MessageTransport<S = TcpStream> {
    stream: S,
}

impl MessageTransport<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| GridError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub async fn send_master_message(&mut self, msg: &MasterMessage) -> Result<()> {
        send_frame(&mut self.stream, msg).await
    }

    pub async fn recv_master_message(&mut self) -> Result<MasterMessage> {
        recv_frame(&mut self.stream).await
    }

    pub async fn send_slave_message(&mut self, msg: &SlaveMessage) -> Result<()> {
        send_frame(&mut self.stream, msg).await
    }

    pub async fn recv_slave_message(&mut self) -> Result<SlaveMessage> {
        recv_frame(&mut self.stream).await
    }

    /// Separates the directions so reading can live in its own task.
    pub fn split(self) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (MessageReader { inner: read }, MessageWriter { inner: write })
    }
}

pub struct MessageReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub async fn recv_master_message(&mut self) -> Result<MasterMessage> {
        recv_frame(&mut self.inner).await
    }

    pub async fn recv_slave_message(&mut self) -> Result<SlaveMessage> {
        recv_frame(&mut self.inner).await
    }
}

pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub async fn send_master_message(&mut self, msg: &MasterMessage) -> Result<()> {
        send_frame(&mut self.inner, msg).await
    }

    pub async fn send_slave_message(&mut self, msg: &SlaveMessage) -> Result<()> {
        send_frame(&mut self.inner, msg).await
    }
}

async fn send_frame<W, T>(w: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(msg)?;
    if data.len() > MAX_FRAME_LEN {
        return Err(GridError::ProtocolError(format!(
            "frame of {} bytes exceeds limit",
            data.len()
        )));
    }
    w.write_u32(data.len() as u32).await?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

async fn recv_frame<R, T>(r: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(GridError::ProtocolError(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    Ok(bincode::deserialize(&data)?)
}
