//! Wire protocol shared with the orchestrator.
//!
//! Every value on the connection is either a fixed-width big-endian integer
//! or a frame: an `i32` length followed by that many bytes. Negative lengths
//! are control codes and carry no payload.
//!
//! - [`codec`]: integer, frame and string primitives
//! - [`serde_mode`]: how frame payloads map to task items
//! - [`input`]: the lazy input sequence read from the connection

pub mod codec;
pub mod input;
pub mod serde_mode;
