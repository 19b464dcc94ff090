//! Configuration for endpoints, limits and timeouts.

use std::time::Duration;

use crate::extensions::DeflateConfig;

/// Resource limits for one connection.
///
/// The message limit applies to the assembled payload: the compressed bytes
/// while fragments accumulate and the inflated bytes once the message is
/// complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum payload of a single frame.
    ///
    /// Default: 16 MB
    pub max_frame_size: usize,

    /// Maximum size of a complete message, text and binary alike.
    ///
    /// Default: 64 MB
    pub max_message_size: usize,

    /// Maximum number of frames in one message.
    ///
    /// Default: unlimited. Fragment count does not change the assembled
    /// size, which `max_message_size` already bounds.
    pub max_fragment_count: usize,

    /// Maximum size of the HTTP upgrade request or response head.
    ///
    /// Default: 8 KB
    pub max_handshake_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            max_fragment_count: usize::MAX,
            max_handshake_size: 8192,
        }
    }
}

impl Limits {
    /// Create limits with custom values.
    #[must_use]
    pub const fn new(
        max_frame_size: usize,
        max_message_size: usize,
        max_fragment_count: usize,
        max_handshake_size: usize,
    ) -> Self {
        Self {
            max_frame_size,
            max_message_size,
            max_fragment_count,
            max_handshake_size,
        }
    }

    /// Set the message limit.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the frame limit.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the fragment limit.
    #[must_use]
    pub const fn with_max_fragment_count(mut self, count: usize) -> Self {
        self.max_fragment_count = count;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`](crate::Error::MessageTooLarge) if `size` exceeds the maximum.
    pub const fn check_message_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_message_size {
            Err(crate::Error::MessageTooLarge {
                size,
                max: self.max_message_size,
            })
        } else {
            Ok(())
        }
    }

    /// Bound on the compressed bytes buffered for one message.
    ///
    /// The inflated size is checked against `max_message_size` at FIN; this
    /// only caps the wire bytes held before then, allowing DEFLATE's
    /// worst-case expansion of incompressible data.
    #[must_use]
    pub const fn max_compressed_size(&self) -> usize {
        let m = self.max_message_size;
        m.saturating_add(m / 8).saturating_add(m / 64).saturating_add(64)
    }

    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`](crate::Error::MessageTooLarge) if `size` exceeds
    /// [`max_compressed_size`](Self::max_compressed_size).
    pub const fn check_compressed_size(&self, size: usize) -> Result<(), crate::Error> {
        let max = self.max_compressed_size();
        if size > max {
            Err(crate::Error::MessageTooLarge { size, max })
        } else {
            Ok(())
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::TooManyFragments`](crate::Error::TooManyFragments) if `count` exceeds the maximum.
    pub const fn check_fragment_count(&self, count: usize) -> Result<(), crate::Error> {
        if count > self.max_fragment_count {
            Err(crate::Error::TooManyFragments {
                count,
                max: self.max_fragment_count,
            })
        } else {
            Ok(())
        }
    }
}

/// Bounded waits enforced by the endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Time allowed to complete the upgrade.
    ///
    /// Default: 10 seconds
    pub handshake: Duration,

    /// Time to wait for the peer's close frame after sending ours.
    ///
    /// Default: 5 seconds
    pub close: Duration,

    /// Server-side: close a connection that sends nothing for this long.
    ///
    /// Default: 300 seconds
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            close: Duration::from_secs(5),
            idle: Duration::from_secs(300),
        }
    }
}

/// Connection configuration shared by clients and servers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Resource limits.
    pub limits: Limits,

    /// Largest frame payload produced when sending.
    ///
    /// Messages (after compression) larger than this are fragmented.
    ///
    /// Default: 64 KB
    pub fragment_size: usize,

    /// Bytes requested from the transport per read.
    ///
    /// Default: 64 KB
    pub read_buffer_size: usize,

    /// Initial capacity of the outgoing frame buffer.
    ///
    /// Default: 8 KB
    pub write_buffer_size: usize,

    /// Handshake, close and idle timeouts.
    pub timeouts: Timeouts,

    /// permessage-deflate policy.
    pub deflate: DeflateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            fragment_size: 64 * 1024,
            read_buffer_size: 64 * 1024,
            write_buffer_size: 8192,
            timeouts: Timeouts::default(),
            deflate: DeflateConfig::default(),
        }
    }
}

impl Config {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set custom limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Shorthand for the message limit, the knob every probe scenario turns.
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.limits.max_message_size = size;
        self
    }

    /// Set the outgoing fragment size (minimum 1).
    #[must_use]
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size.max(1);
        self
    }

    /// Set read buffer size.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set write buffer size.
    #[must_use]
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the permessage-deflate policy.
    #[must_use]
    pub fn with_deflate(mut self, deflate: DeflateConfig) -> Self {
        self.deflate = deflate;
        self
    }

    /// Server defaults: reject unmasked client frames.
    #[must_use]
    pub fn server() -> Self {
        Self::default()
    }

    /// Client defaults.
    #[must_use]
    pub fn client() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_default() {
        let limits = Limits::default();
        assert_eq!(limits.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(limits.max_message_size, 64 * 1024 * 1024);
        assert_eq!(limits.max_fragment_count, usize::MAX);
        assert_eq!(limits.max_handshake_size, 8192);
    }

    #[test]
    fn test_limits_builders() {
        let limits = Limits::default()
            .with_max_message_size(5 * 1024 * 1024)
            .with_max_frame_size(1024)
            .with_max_fragment_count(8);
        assert_eq!(limits, Limits::new(1024, 5 * 1024 * 1024, 8, 8192));
    }

    #[test]
    fn test_limits_check_message_size() {
        let limits = Limits::default().with_max_message_size(100);
        assert!(limits.check_message_size(100).is_ok());
        assert_eq!(
            limits.check_message_size(101),
            Err(crate::Error::MessageTooLarge { size: 101, max: 100 })
        );
    }

    #[test]
    fn test_limits_check_compressed_size() {
        let limits = Limits::default().with_max_message_size(64 * 1024);
        assert!(limits.max_compressed_size() > 64 * 1024 + 64 * 1024 / 8);
        assert!(limits.check_compressed_size(65_557).is_ok());
        assert!(limits.check_compressed_size(limits.max_compressed_size()).is_ok());
        assert!(matches!(
            limits.check_compressed_size(limits.max_compressed_size() + 1),
            Err(crate::Error::MessageTooLarge { .. })
        ));

        let unbounded = Limits::default().with_max_message_size(usize::MAX);
        assert_eq!(unbounded.max_compressed_size(), usize::MAX);
    }

    #[test]
    fn test_limits_check_fragment_count() {
        assert!(Limits::default().check_fragment_count(1 << 20).is_ok());

        let limits = Limits::default().with_max_fragment_count(1024);
        assert!(limits.check_fragment_count(1024).is_ok());
        assert!(limits.check_fragment_count(1025).is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.fragment_size, 64 * 1024);
        assert!(config.deflate.enabled);
        assert_eq!(config.timeouts, Timeouts::default());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .with_max_message_size(5 * 1024 * 1024)
            .with_fragment_size(0)
            .with_deflate(DeflateConfig::disabled());

        assert_eq!(config.limits.max_message_size, 5 * 1024 * 1024);
        assert_eq!(config.fragment_size, 1);
        assert!(!config.deflate.enabled);
    }

    #[test]
    fn test_timeouts_default() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.handshake, Duration::from_secs(10));
        assert_eq!(timeouts.close, Duration::from_secs(5));
        assert_eq!(timeouts.idle, Duration::from_secs(300));
    }
}
