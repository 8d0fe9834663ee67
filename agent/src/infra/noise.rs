//! Noise-secured, length-prefixed framing over a TCP stream.
//!
//! Every handshake or transport message is one frame: a 2-byte big-endian
//! length followed by that many bytes. After the handshake each frame carries
//! exactly one encrypted UTF-8 line.

use std::io;

use anyhow::{Context, Result, bail};
use hive_common::channel::{MAX_FRAME_LEN, NOISE_PATTERN, TAG_LEN};
use snow::params::NoiseParams;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::infra::keys::ChannelKeys;

/// Largest line that fits in one encrypted frame.
pub const MAX_LINE_LEN: usize = MAX_FRAME_LEN - TAG_LEN;

/// An established, authenticated channel.
pub struct NoiseStream {
    stream: TcpStream,
    transport: snow::TransportState,
    buf: Vec<u8>,
    remote_static: Vec<u8>,
}

impl NoiseStream {
    /// Run the initiator side of the handshake over a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the peer does not hold the
    /// expected static key.
    pub async fn initiate(mut stream: TcpStream, keys: &ChannelKeys) -> Result<Self> {
        let mut handshake = snow::Builder::new(params()?)
            .local_private_key(keys.secret())
            .remote_public_key(keys.server_public())
            .build_initiator()
            .context("building noise initiator")?;
        let mut buf = vec![0u8; MAX_FRAME_LEN];

        let len = handshake
            .write_message(&[], &mut buf)
            .context("writing handshake")?;
        write_frame(&mut stream, &buf[..len])
            .await
            .context("sending handshake")?;
        let reply = read_frame(&mut stream)
            .await
            .context("reading handshake reply")?;
        handshake
            .read_message(&reply, &mut buf)
            .context("verifying handshake reply")?;

        Self::finish(stream, handshake, buf)
    }

    /// Run the responder side of the handshake, as the coordinator does.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a malformed handshake.
    pub async fn accept(mut stream: TcpStream, secret: &[u8]) -> Result<Self> {
        let mut handshake = snow::Builder::new(params()?)
            .local_private_key(secret)
            .build_responder()
            .context("building noise responder")?;
        let mut buf = vec![0u8; MAX_FRAME_LEN];

        let hello = read_frame(&mut stream).await.context("reading handshake")?;
        handshake
            .read_message(&hello, &mut buf)
            .context("verifying handshake")?;
        let len = handshake
            .write_message(&[], &mut buf)
            .context("writing handshake reply")?;
        write_frame(&mut stream, &buf[..len])
            .await
            .context("sending handshake reply")?;

        Self::finish(stream, handshake, buf)
    }

    fn finish(stream: TcpStream, handshake: snow::HandshakeState, buf: Vec<u8>) -> Result<Self> {
        let remote_static = handshake
            .get_remote_static()
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let transport = handshake
            .into_transport_mode()
            .context("completing handshake")?;
        Ok(Self {
            stream,
            transport,
            buf,
            remote_static,
        })
    }

    /// Static public key the peer proved during the handshake.
    #[must_use]
    pub fn remote_static(&self) -> &[u8] {
        &self.remote_static
    }

    /// Encrypt and write one line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line does not fit one frame or the write fails.
    pub async fn send(&mut self, line: &str) -> Result<()> {
        if line.len() > MAX_LINE_LEN {
            bail!(
                "message of {} bytes exceeds the {MAX_LINE_LEN}-byte frame limit",
                line.len()
            );
        }
        let len = self
            .transport
            .write_message(line.as_bytes(), &mut self.buf)
            .context("encrypting frame")?;
        write_frame(&mut self.stream, &self.buf[..len]).await?;
        Ok(())
    }

    /// Read and decrypt one line. `None` once the peer closed the stream.
    ///
    /// Not cancel-safe: a cancelled read leaves the stream mid-frame.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, a frame that does not decrypt, or a
    /// line that is not UTF-8.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let frame = match read_frame(&mut self.stream).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("reading frame"),
        };
        let len = self
            .transport
            .read_message(&frame, &mut self.buf)
            .context("decrypting frame")?;
        let line = std::str::from_utf8(&self.buf[..len]).context("decoding frame as UTF-8")?;
        Ok(Some(line.to_string()))
    }

    /// Resolve once the peer closes the stream or the connection fails.
    ///
    /// For write-only links; anything the peer sends is discarded. Cancel-safe.
    pub async fn closed(&mut self) -> io::Error {
        let mut scratch = [0u8; 512];
        loop {
            match self.stream.read(&mut scratch).await {
                Ok(0) => return io::ErrorKind::UnexpectedEof.into(),
                Ok(_) => {}
                Err(e) => return e,
            }
        }
    }
}

fn params() -> Result<NoiseParams> {
    NOISE_PATTERN.parse().context("parsing noise pattern")
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> io::Result<()> {
    let len = u16::try_from(frame.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(frame).await?;
    w.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = r.read_u16().await?;
    let mut frame = vec![0u8; usize::from(len)];
    r.read_exact(&mut frame).await?;
    Ok(frame)
}
