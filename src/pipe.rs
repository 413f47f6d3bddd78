//! The cipher pipe: framed AES-128-CTR streams over the socket.
//!
//! The handshake yields one [`CipherReader`] and one [`CipherWriter`]
//! per session, keyed per direction. Everything above this layer sees
//! whole plaintext CoAP datagrams.
//!
//! Frame format: a 2-byte big-endian length prefix in the clear, then
//! that many keystream-encrypted bytes. The CTR keystream runs
//! continuously across frames within a direction, so frames cannot be
//! replayed or reordered without garbling everything that follows.

use std::io::ErrorKind;

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::STREAM_KEY_SIZE;
use crate::error::{CoreError, Result};

type Aes128Ctr = Ctr128BE<Aes128>;

/// Boxed read half handed over by the handshake.
pub type IoReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half handed over by the handshake.
pub type IoWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Decrypt-inbound half of the pipe.
pub struct CipherReader {
    io: IoReader,
    cipher: Aes128Ctr,
}

impl CipherReader {
    pub fn new(io: IoReader, key: &[u8; STREAM_KEY_SIZE], iv: &[u8; STREAM_KEY_SIZE]) -> Self {
        Self {
            io,
            cipher: Aes128Ctr::new(key.into(), iv.into()),
        }
    }

    /// Read and decrypt the next whole frame.
    ///
    /// Returns `Ok(None)` on a clean peer close at a frame boundary.
    /// EOF in the middle of a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 2];
        match self.io.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(CoreError::Framing("Zero-length frame".to_string()));
        }

        let mut frame = vec![0u8; len];
        self.io.read_exact(&mut frame).await?;
        self.cipher.apply_keystream(&mut frame);
        Ok(Some(frame))
    }
}

/// Encrypt-outbound half of the pipe.
pub struct CipherWriter {
    io: IoWriter,
    cipher: Aes128Ctr,
    closed: bool,
}

impl CipherWriter {
    pub fn new(io: IoWriter, key: &[u8; STREAM_KEY_SIZE], iv: &[u8; STREAM_KEY_SIZE]) -> Self {
        Self {
            io,
            cipher: Aes128Ctr::new(key.into(), iv.into()),
            closed: false,
        }
    }

    /// Encrypt and write one whole frame.
    pub async fn write_frame(&mut self, plaintext: &[u8]) -> Result<()> {
        if self.closed {
            return Err(CoreError::NotReady);
        }
        if plaintext.len() > u16::MAX as usize {
            return Err(CoreError::Framing(format!(
                "Frame too large: {} bytes",
                plaintext.len()
            )));
        }

        let mut buf = Vec::with_capacity(2 + plaintext.len());
        buf.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());
        let body_start = buf.len();
        buf.extend_from_slice(plaintext);
        self.cipher.apply_keystream(&mut buf[body_start..]);

        self.io.write_all(&buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// End the stream. Safe to call any number of times.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.io.shutdown().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
