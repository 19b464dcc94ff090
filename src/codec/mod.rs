//! Frame-level reading and writing over async streams.
//!
//! The reader and writer are separate types so a connection can be split
//! into independently owned halves.

mod framed;

pub use framed::{FrameReader, FrameWriter, read_head};
