use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Config;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::handshake::find_head_end;
use crate::protocol::validation::FrameValidator;
use crate::protocol::{Frame, FrameHeader};

/// Seed for mask generation, from the OS with a clock fallback.
fn random_mask_seed() -> u32 {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_ok() {
        u32::from_le_bytes(buf)
    } else {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
            .unwrap_or(0x1234_5678)
    }
}

/// Read an HTTP head terminated by a blank line.
///
/// Bytes that arrive after the head stay in `buf`; they belong to the first
/// WebSocket frame and must seed the [`FrameReader`].
///
/// # Errors
///
/// - `Error::HandshakeTooLarge` once `max_size` bytes arrive without a blank line
/// - `Error::ConnectionClosed` if the peer hangs up first
pub async fn read_head<R>(io: &mut R, buf: &mut BytesMut, max_size: usize) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_head_end(buf) {
            return Ok(buf.split_to(end));
        }
        if buf.len() >= max_size {
            return Err(Error::HandshakeTooLarge {
                size: buf.len(),
                max: max_size,
            });
        }
        buf.reserve(1024);
        if io.read_buf(buf).await? == 0 {
            return Err(Error::ConnectionClosed(None));
        }
    }
}

/// Reading half: buffers transport bytes and yields validated frames.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    read_size: usize,
    validator: FrameValidator,
}

impl<R> std::fmt::Debug for FrameReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("buffered", &self.buf.len())
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader for the receiving side of `role`.
    ///
    /// `leftover` holds bytes read past the handshake head.
    pub fn new(io: R, role: Role, config: &Config, leftover: BytesMut) -> Self {
        let validator = FrameValidator::new(role, config.limits.clone());
        let mut buf = BytesMut::with_capacity(config.read_buffer_size.max(leftover.len()));
        buf.extend_from_slice(&leftover);
        Self {
            io,
            buf,
            read_size: config.read_buffer_size,
            validator,
        }
    }

    /// Allow RSV1 once permessage-deflate is negotiated.
    #[must_use]
    pub fn with_compression(mut self, negotiated: bool) -> Self {
        self.validator = self.validator.with_compression(negotiated);
        self
    }

    /// Read the next frame.
    ///
    /// The header is validated as soon as it is complete, so an oversized or
    /// malformed frame is rejected before its payload is buffered.
    ///
    /// # Errors
    ///
    /// Any header or validation error, `Error::Io` from the transport, and
    /// `Error::ConnectionClosed(None)` on EOF.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            match FrameHeader::parse(&self.buf) {
                Ok(header) => {
                    self.validator.validate_header(&header)?;
                    let payload_len =
                        usize::try_from(header.payload_len).map_err(|_| Error::FrameTooLarge {
                            size: usize::MAX,
                            max: usize::MAX,
                        })?;
                    let total = header.header_len + payload_len;
                    if self.buf.len() >= total {
                        let mut raw = self.buf.split_to(total);
                        let payload = raw.split_off(header.header_len);
                        return Ok(Frame::from_parts(&header, payload));
                    }
                    self.buf.reserve(total - self.buf.len());
                }
                Err(Error::IncompleteFrame { .. }) => {}
                Err(e) => return Err(e),
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        self.buf.reserve(self.read_size);
        let n = self.io.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed(None));
        }
        Ok(())
    }

    /// Discard everything until EOF. Used once the byte stream can no
    /// longer be parsed as frames but the peer should still see our close.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the transport fails.
    pub async fn skip_to_eof(&mut self) -> Result<()> {
        loop {
            self.buf.clear();
            match self.fill().await {
                Ok(()) => {}
                Err(Error::ConnectionClosed(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Writing half: encodes frames, masking them on the client side.
pub struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
    role: Role,
    mask_counter: u32,
}

impl<W> std::fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a writer for `role`.
    pub fn new(io: W, role: Role, config: &Config) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(config.write_buffer_size),
            role,
            mask_counter: random_mask_seed(),
        }
    }

    fn generate_mask(&mut self) -> [u8; 4] {
        self.mask_counter = self.mask_counter.wrapping_add(0x9E37_79B9);
        let a = self.mask_counter;
        let b = a.wrapping_mul(0x85EB_CA6B);
        let c = b ^ (b >> 13);
        c.wrapping_mul(0xC2B2_AE35).to_le_bytes()
    }

    /// Encode and write one frame. Does not flush.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the transport fails.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mask = self.role.must_mask().then(|| self.generate_mask());
        self.buf.clear();
        frame.encode(mask, &mut self.buf);
        self.io.write_all(&self.buf).await?;
        Ok(())
    }

    /// Flush the transport.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the transport fails.
    pub async fn flush(&mut self) -> Result<()> {
        self.io.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the transport.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the transport fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
