//! Blocking streaming client.
//!
//! Performs the handshake, follows a sandbox redirect, then exchanges one
//! chunk per `process` call.

use crate::chunk::{read_chunk_payload, write_chunk, AudioBlock, ChunkHeader, Sample};
use crate::error::{GridError, Result};
use crate::protocol::{
    read_frame, write_frame, HandshakeRequest, HandshakeResponse, HandshakeStatus, MidiBuffer,
    PROTOCOL_VERSION,
};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub struct StreamClient {
    stream: TcpStream,
    request: HandshakeRequest,
    sandbox_port: Option<u16>,
    scratch: Vec<u8>,
}

impl StreamClient {
    pub fn connect(addr: impl ToSocketAddrs, request: HandshakeRequest) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| GridError::ConnectionFailed("no address to connect to".to_string()))?;

        let stream = open(addr)?;
        write_frame(&stream, &request)?;
        let response: HandshakeResponse = read_frame(&stream)?;
        if response.version != PROTOCOL_VERSION {
            return Err(GridError::ProtocolError(format!(
                "server speaks protocol {}, client {}",
                response.version, PROTOCOL_VERSION
            )));
        }

        match response.status {
            HandshakeStatus::Local => {
                tracing::debug!("Session hosted by server at {}", addr);
                Ok(Self {
                    stream,
                    request,
                    sandbox_port: None,
                    scratch: Vec::new(),
                })
            }
            HandshakeStatus::Sandbox { port } => {
                drop(stream);
                let sandbox_addr = SocketAddr::new(addr.ip(), port);
                tracing::debug!("Session redirected to sandbox at {}", sandbox_addr);
                Ok(Self {
                    stream: open(sandbox_addr)?,
                    request,
                    sandbox_port: Some(port),
                    scratch: Vec::new(),
                })
            }
            HandshakeStatus::Rejected { reason } => Err(GridError::HandshakeRejected(reason)),
        }
    }

    /// Sends `block` and `midi`, then replaces both with the processed result.
    pub fn process<T: Sample>(
        &mut self,
        block: &mut AudioBlock<T>,
        midi: &mut MidiBuffer,
    ) -> Result<()> {
        if T::FORMAT != self.request.sample_format {
            return Err(GridError::InvalidChunk(format!(
                "session negotiated {:?}, block is {:?}",
                self.request.sample_format,
                T::FORMAT
            )));
        }
        let sent = ChunkHeader::new(block.num_channels(), block.num_samples(), T::FORMAT);
        write_chunk(&self.stream, block, midi, &mut self.scratch)?;

        let header = ChunkHeader::read_from(&self.stream)?;
        if header != sent {
            return Err(GridError::ProtocolError(format!(
                "response header {:?} does not mirror request {:?}",
                header, sent
            )));
        }
        read_chunk_payload(&self.stream, &header, block, midi, &mut self.scratch)
    }

    /// Port of the sandbox hosting this session, if it was redirected.
    pub fn sandbox_port(&self) -> Option<u16> {
        self.sandbox_port
    }

    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    /// Raw connection, for callers that frame chunks themselves.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }
}

fn open(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .map_err(|e| GridError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
