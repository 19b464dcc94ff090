//! Permessage-deflate compression extension (RFC 7692).
//!
//! Negotiation lives on [`DeflateConfig`] (local policy) and produces an
//! immutable [`DeflateParams`]. The per-direction streaming state is held by
//! [`Deflater`] and [`Inflater`], which compress or inflate one whole message
//! at a time and keep the LZ77 window between messages unless context
//! takeover was disabled for that direction.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::connection::Role;
use crate::error::{Error, Result};
use crate::extensions::{ExtensionOffer, ExtensionParam};

/// Registered extension token.
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Smallest window the zlib backend can produce raw DEFLATE with.
pub const MIN_WINDOW_BITS: u8 = 9;
/// Largest LZ77 window allowed by RFC 7692.
pub const MAX_WINDOW_BITS: u8 = 15;

const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";

/// Tail of every sync-flushed block; stripped on send, restored on receive.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Local policy for permessage-deflate.
///
/// On a server these are the strictest terms it will agree to; on a client
/// they are what it offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Offer (client) or accept (server) the extension at all.
    pub enabled: bool,
    /// zlib compression level, 0-9.
    pub compression_level: u32,
    /// Ask the server to reset its compressor after every message.
    pub server_no_context_takeover: bool,
    /// Ask the client to reset its compressor after every message.
    pub client_no_context_takeover: bool,
    /// Largest window the server side compresses with.
    pub server_max_window_bits: u8,
    /// Largest window the client side compresses with.
    pub client_max_window_bits: u8,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compression_level: 6,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
        }
    }
}

impl DeflateConfig {
    /// Default policy: enabled, level 6, full windows, context takeover on.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never negotiates compression.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Request `server_no_context_takeover`.
    #[must_use]
    pub const fn server_no_context_takeover(mut self, value: bool) -> Self {
        self.server_no_context_takeover = value;
        self
    }

    /// Request `client_no_context_takeover`.
    #[must_use]
    pub const fn client_no_context_takeover(mut self, value: bool) -> Self {
        self.client_no_context_takeover = value;
        self
    }

    /// Limit the server's window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] outside 9..=15.
    pub fn server_max_window_bits(mut self, bits: u8) -> Result<Self> {
        self.server_max_window_bits = check_window_bits(SERVER_MAX_WINDOW_BITS, bits)?;
        Ok(self)
    }

    /// Limit the client's window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] outside 9..=15.
    pub fn client_max_window_bits(mut self, bits: u8) -> Result<Self> {
        self.client_max_window_bits = check_window_bits(CLIENT_MAX_WINDOW_BITS, bits)?;
        Ok(self)
    }

    /// Set the zlib compression level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] above 9.
    pub fn compression_level(mut self, level: u32) -> Result<Self> {
        if level > 9 {
            return Err(Error::InvalidExtension(format!(
                "compression_level must be 0-9, got {level}"
            )));
        }
        self.compression_level = level;
        Ok(self)
    }

    /// The client's `Sec-WebSocket-Extensions` offer for this policy.
    ///
    /// `client_max_window_bits` is always offered so the server may shrink
    /// the client's window.
    #[must_use]
    pub fn offer(&self) -> ExtensionOffer {
        let mut params = Vec::new();
        if self.server_no_context_takeover {
            params.push(ExtensionParam::flag(SERVER_NO_CONTEXT_TAKEOVER));
        }
        if self.client_no_context_takeover {
            params.push(ExtensionParam::flag(CLIENT_NO_CONTEXT_TAKEOVER));
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            params.push(ExtensionParam::new(
                SERVER_MAX_WINDOW_BITS,
                self.server_max_window_bits.to_string(),
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            params.push(ExtensionParam::new(
                CLIENT_MAX_WINDOW_BITS,
                self.client_max_window_bits.to_string(),
            ));
        } else {
            params.push(ExtensionParam::flag(CLIENT_MAX_WINDOW_BITS));
        }
        ExtensionOffer::with_params(EXTENSION_NAME, params)
    }

    /// Server side: accept one client offer or decline it.
    ///
    /// Returns `None` when the offer carries unknown, duplicated or
    /// out-of-range parameters, in which case the next offer (or no
    /// compression) is used.
    #[must_use]
    pub fn accept(&self, offer: &ExtensionOffer) -> Option<DeflateParams> {
        if !self.enabled || offer.name != EXTENSION_NAME || has_duplicates(&offer.params) {
            return None;
        }

        let mut params = DeflateParams {
            server_no_context_takeover: self.server_no_context_takeover,
            client_no_context_takeover: self.client_no_context_takeover,
            server_max_window_bits: self.server_max_window_bits,
            // Only a client that offered client_max_window_bits can be limited.
            client_max_window_bits: MAX_WINDOW_BITS,
            compression_level: self.compression_level,
        };

        for param in &offer.params {
            match param.name.as_str() {
                SERVER_NO_CONTEXT_TAKEOVER if param.value.is_none() => {
                    params.server_no_context_takeover = true;
                }
                CLIENT_NO_CONTEXT_TAKEOVER if param.value.is_none() => {
                    params.client_no_context_takeover = true;
                }
                SERVER_MAX_WINDOW_BITS => {
                    let bits = parse_window_bits(param.value.as_deref()).ok()?;
                    params.server_max_window_bits = params.server_max_window_bits.min(bits);
                }
                CLIENT_MAX_WINDOW_BITS => {
                    let offered = match param.value.as_deref() {
                        None => MAX_WINDOW_BITS,
                        value => parse_window_bits(value).ok()?,
                    };
                    params.client_max_window_bits = self.client_max_window_bits.min(offered);
                }
                _ => return None,
            }
        }

        Some(params)
    }

    /// Client side: validate the server's response to [`DeflateConfig::offer`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] when the response contains
    /// parameters the offer did not allow, which fails the connection.
    pub fn configure(&self, response: &ExtensionOffer) -> Result<DeflateParams> {
        if response.name != EXTENSION_NAME {
            return Err(Error::InvalidExtension(format!(
                "server accepted an extension that was not offered: {}",
                response.name
            )));
        }
        if has_duplicates(&response.params) {
            return Err(Error::InvalidExtension(
                "duplicate permessage-deflate parameter".into(),
            ));
        }

        let mut params = DeflateParams {
            compression_level: self.compression_level,
            ..DeflateParams::default()
        };

        for param in &response.params {
            match param.name.as_str() {
                SERVER_NO_CONTEXT_TAKEOVER if param.value.is_none() => {
                    params.server_no_context_takeover = true;
                }
                CLIENT_NO_CONTEXT_TAKEOVER if param.value.is_none() => {
                    params.client_no_context_takeover = true;
                }
                SERVER_MAX_WINDOW_BITS => {
                    let bits = parse_window_bits(param.value.as_deref())?;
                    if bits > self.server_max_window_bits {
                        return Err(Error::InvalidExtension(format!(
                            "server_max_window_bits={bits} exceeds offered {}",
                            self.server_max_window_bits
                        )));
                    }
                    params.server_max_window_bits = bits;
                }
                CLIENT_MAX_WINDOW_BITS => {
                    params.client_max_window_bits = parse_window_bits(param.value.as_deref())?;
                }
                other => {
                    return Err(Error::InvalidExtension(format!(
                        "unexpected permessage-deflate parameter: {other}"
                    )));
                }
            }
        }

        if self.server_no_context_takeover && !params.server_no_context_takeover {
            return Err(Error::InvalidExtension(
                "server ignored server_no_context_takeover".into(),
            ));
        }
        // Our own request binds us even if the server did not echo it.
        params.client_no_context_takeover |= self.client_no_context_takeover;
        params.client_max_window_bits =
            params.client_max_window_bits.min(self.client_max_window_bits);

        Ok(params)
    }
}

/// Negotiated permessage-deflate terms, fixed for the connection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    /// Server resets its compressor after each message.
    pub server_no_context_takeover: bool,
    /// Client resets its compressor after each message.
    pub client_no_context_takeover: bool,
    /// Server compression window.
    pub server_max_window_bits: u8,
    /// Client compression window.
    pub client_max_window_bits: u8,
    /// Local zlib level; not part of the wire agreement.
    pub compression_level: u32,
}

impl Default for DeflateParams {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
            compression_level: 6,
        }
    }
}

impl DeflateParams {
    /// The accepted subset, as the server echoes it in its response.
    #[must_use]
    pub fn response(&self) -> ExtensionOffer {
        let mut params = Vec::new();
        if self.server_no_context_takeover {
            params.push(ExtensionParam::flag(SERVER_NO_CONTEXT_TAKEOVER));
        }
        if self.client_no_context_takeover {
            params.push(ExtensionParam::flag(CLIENT_NO_CONTEXT_TAKEOVER));
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            params.push(ExtensionParam::new(
                SERVER_MAX_WINDOW_BITS,
                self.server_max_window_bits.to_string(),
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            params.push(ExtensionParam::new(
                CLIENT_MAX_WINDOW_BITS,
                self.client_max_window_bits.to_string(),
            ));
        }
        ExtensionOffer::with_params(EXTENSION_NAME, params)
    }

    /// Compressor for messages this endpoint sends.
    #[must_use]
    pub fn deflater(&self, role: Role) -> Deflater {
        match role {
            Role::Server => Deflater::new(
                self.compression_level,
                self.server_max_window_bits,
                self.server_no_context_takeover,
            ),
            Role::Client => Deflater::new(
                self.compression_level,
                self.client_max_window_bits,
                self.client_no_context_takeover,
            ),
        }
    }

    /// Decompressor for messages the peer sends.
    #[must_use]
    pub fn inflater(&self, role: Role) -> Inflater {
        match role {
            Role::Server => Inflater::new(self.client_no_context_takeover),
            Role::Client => Inflater::new(self.server_no_context_takeover),
        }
    }
}

/// Outgoing raw DEFLATE stream for one connection.
pub struct Deflater {
    compress: Compress,
    level: u32,
    window_bits: u8,
    no_context_takeover: bool,
}

impl std::fmt::Debug for Deflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deflater")
            .field("level", &self.level)
            .field("window_bits", &self.window_bits)
            .field("no_context_takeover", &self.no_context_takeover)
            .field("total_in", &self.compress.total_in())
            .finish()
    }
}

impl Deflater {
    /// Create a compressor with an explicit window.
    #[must_use]
    pub fn new(level: u32, window_bits: u8, no_context_takeover: bool) -> Self {
        let window_bits = window_bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS);
        Self {
            compress: Compress::new_with_window_bits(
                Compression::new(level),
                false,
                window_bits,
            ),
            level,
            window_bits,
            no_context_takeover,
        }
    }

    /// Compress one whole message payload.
    ///
    /// The output is sync-flushed with the trailing `00 00 ff ff` removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compression`] if zlib rejects the stream state.
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let start_in = self.compress.total_in();

        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(4096));
            }
            let consumed = (self.compress.total_in() - start_in) as usize;
            self.compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)?;
            let consumed = (self.compress.total_in() - start_in) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }
        if out.is_empty() {
            // An empty stored block; a zero-length payload would leave the
            // peer's stream without a block boundary.
            out.push(0x00);
        }
        if self.no_context_takeover {
            self.reset();
        }
        Ok(out)
    }

    /// Whether the window is dropped after every message.
    #[must_use]
    pub const fn resets_context(&self) -> bool {
        self.no_context_takeover
    }

    fn reset(&mut self) {
        self.compress =
            Compress::new_with_window_bits(Compression::new(self.level), false, self.window_bits);
    }
}

/// Incoming raw DEFLATE stream for one connection.
pub struct Inflater {
    decompress: Decompress,
    no_context_takeover: bool,
}

impl std::fmt::Debug for Inflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("no_context_takeover", &self.no_context_takeover)
            .field("total_out", &self.decompress.total_out())
            .finish()
    }
}

impl Inflater {
    /// Create a decompressor. It always uses a 15-bit window, which decodes
    /// any smaller window the peer agreed to.
    #[must_use]
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            decompress: Decompress::new(false),
            no_context_takeover,
        }
    }

    /// Inflate one whole message payload, trailer not included.
    ///
    /// Output is bounded by `max_output`; the stream is abandoned as soon as
    /// it would exceed it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] past `max_output` and
    /// [`Error::Decompression`] on a corrupt stream. The inflater must not
    /// be reused after either.
    pub fn decompress(&mut self, data: &[u8], max_output: usize) -> Result<Vec<u8>> {
        let initial = data
            .len()
            .saturating_mul(2)
            .max(64)
            .min(max_output.saturating_add(1));
        let mut out = Vec::with_capacity(initial);

        let finished = self.inflate_into(data, &mut out, max_output)?;
        if !finished {
            self.inflate_into(&DEFLATE_TRAILER, &mut out, max_output)?;
        }

        if finished || self.no_context_takeover {
            self.decompress = Decompress::new(false);
        }
        Ok(out)
    }

    /// Returns `true` if the peer ended the stream with a final block.
    fn inflate_into(&mut self, input: &[u8], out: &mut Vec<u8>, max_output: usize) -> Result<bool> {
        let limit = max_output.saturating_add(1);
        let start_in = self.decompress.total_in();

        loop {
            if out.len() == out.capacity() {
                if out.len() >= limit {
                    return Err(Error::MessageTooLarge {
                        size: out.len(),
                        max: max_output,
                    });
                }
                let grow = out.capacity().max(4096).min(limit - out.len());
                out.reserve_exact(grow);
            }

            let consumed = (self.decompress.total_in() - start_in) as usize;
            let before_out = out.len();
            let status =
                self.decompress
                    .decompress_vec(&input[consumed..], out, FlushDecompress::Sync)?;
            let now_consumed = (self.decompress.total_in() - start_in) as usize;

            if out.len() > max_output {
                return Err(Error::MessageTooLarge {
                    size: out.len(),
                    max: max_output,
                });
            }
            if status == Status::StreamEnd {
                return Ok(true);
            }
            if now_consumed == input.len() && out.len() < out.capacity() {
                return Ok(false);
            }
            if now_consumed == consumed && out.len() == before_out && out.len() < out.capacity() {
                return Err(Error::Decompression("inflate made no progress".into()));
            }
        }
    }
}

fn check_window_bits(name: &str, bits: u8) -> Result<u8> {
    if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        Ok(bits)
    } else {
        Err(Error::InvalidExtension(format!(
            "{name} must be {MIN_WINDOW_BITS}-{MAX_WINDOW_BITS}, got {bits}"
        )))
    }
}

fn parse_window_bits(value: Option<&str>) -> Result<u8> {
    let value =
        value.ok_or_else(|| Error::InvalidExtension("window bits value required".into()))?;
    // RFC 7692 forbids leading zeros and signs.
    if value.is_empty() || value.starts_with('0') || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidExtension(format!(
            "invalid window bits value: {value}"
        )));
    }
    let bits: u8 = value
        .parse()
        .map_err(|_| Error::InvalidExtension(format!("invalid window bits value: {value}")))?;
    check_window_bits("window bits", bits)
}

fn has_duplicates(params: &[ExtensionParam]) -> bool {
    params
        .iter()
        .enumerate()
        .any(|(i, p)| params[..i].iter().any(|q| q.name == p.name))
}
