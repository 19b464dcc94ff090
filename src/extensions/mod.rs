//! `Sec-WebSocket-Extensions` parsing and negotiation.
//!
//! The header grammar (RFC 6455 section 9.1) is parsed into
//! [`ExtensionOffer`]s; the only extension this endpoint understands is
//! permessage-deflate, negotiated by [`negotiate`] on the server and
//! [`configure`] on the client.
//!
//! ```rust,ignore
//! use pmdecho::extensions::{negotiate, DeflateConfig};
//!
//! let outcome = negotiate(Some("permessage-deflate; client_max_window_bits"), &DeflateConfig::default());
//! assert!(outcome.params.is_some());
//! ```

pub mod deflate;

use std::fmt;

use crate::error::{Error, Result};

pub use deflate::{DeflateConfig, DeflateParams, Deflater, Inflater};

/// A single extension parameter: `name` or `name=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    /// Parameter name (e.g. `client_max_window_bits`).
    pub name: String,
    /// Value, or `None` for a flag.
    pub value: Option<String>,
}

impl ExtensionParam {
    /// Create a parameter with a value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Create a flag parameter.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Parse `param` or `param=value` (value may be a quoted string).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if the name or value is not a
    /// valid token.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('=') {
            Some((name, value)) => {
                let name = token(name.trim())?;
                let value = value.trim();
                let unquoted = match value.strip_prefix('"') {
                    Some(rest) => rest.strip_suffix('"').ok_or_else(|| {
                        Error::InvalidExtension(format!("unterminated quoted value: {value}"))
                    })?,
                    None => value,
                };
                Ok(Self::new(name, token(unquoted)?))
            }
            None => Ok(Self::flag(token(s)?)),
        }
    }
}

impl fmt::Display for ExtensionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One extension from the header, with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension token (e.g. `permessage-deflate`).
    pub name: String,
    /// Parameters in header order.
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    /// Create an offer with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Create an offer with parameters.
    pub fn with_params(name: impl Into<String>, params: Vec<ExtensionParam>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Parse `name; param1=value1; param2`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] on an empty or non-token name or
    /// on any malformed parameter.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let name = token(parts.next().unwrap_or_default().trim())?;
        let params = parts.map(ExtensionParam::parse).collect::<Result<Vec<_>>>()?;
        Ok(Self::with_params(name, params))
    }

    /// Parse every comma-separated offer in a header value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if any element is malformed.
    pub fn parse_header(header: &str) -> Result<Vec<Self>> {
        header.split(',').map(|s| Self::parse(s.trim())).collect()
    }

    /// Get a parameter by name.
    pub fn get_param(&self, name: &str) -> Option<&ExtensionParam> {
        self.params.iter().find(|p| p.name == name)
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for param in &self.params {
            write!(f, "; {param}")?;
        }
        Ok(())
    }
}

/// Server-side negotiation result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    /// Value for the response's `Sec-WebSocket-Extensions`, if anything was accepted.
    pub response: Option<String>,
    /// Agreed compression terms; `None` means messages flow uncompressed.
    pub params: Option<DeflateParams>,
}

/// Pick the first acceptable permessage-deflate offer from a client header.
///
/// A malformed header or an offer with bad parameters is declined, never
/// fatal: the connection proceeds without compression.
#[must_use]
pub fn negotiate(header: Option<&str>, config: &DeflateConfig) -> Negotiated {
    let Some(header) = header else {
        return Negotiated::default();
    };
    let offers = match ExtensionOffer::parse_header(header) {
        Ok(offers) => offers,
        Err(err) => {
            tracing::debug!(%err, header, "declining malformed extension header");
            return Negotiated::default();
        }
    };

    for offer in &offers {
        if let Some(params) = config.accept(offer) {
            return Negotiated {
                response: Some(params.response().to_string()),
                params: Some(params),
            };
        }
        tracing::debug!(offer = %offer, "extension offer declined");
    }
    Negotiated::default()
}

/// Client-side check of the server's response header.
///
/// # Errors
///
/// Returns [`Error::InvalidExtension`] if the server accepted something that
/// was not offered, accepted more than one extension, or sent parameters
/// outside the offer.
pub fn configure(header: Option<&str>, config: &DeflateConfig) -> Result<Option<DeflateParams>> {
    let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(None);
    };
    if !config.enabled {
        return Err(Error::InvalidExtension(format!(
            "server accepted extensions that were not offered: {header}"
        )));
    }
    let responses = ExtensionOffer::parse_header(header)?;
    match responses.as_slice() {
        [response] => config.configure(response).map(Some),
        _ => Err(Error::InvalidExtension(format!(
            "expected a single accepted extension, got: {header}"
        ))),
    }
}

/// RFC 7230 token characters.
fn token(s: &str) -> Result<&str> {
    let valid = !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        });
    if valid {
        Ok(s)
    } else {
        Err(Error::InvalidExtension(format!("invalid token: {s:?}")))
    }
}
