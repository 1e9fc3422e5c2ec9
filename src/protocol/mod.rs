//! Wire protocol codec
//!
//! Encoding of command frames and incremental decoding of streamed replies.

pub mod decoder;
pub mod encoder;
pub mod value;

pub use decoder::Decoder;
pub use encoder::{encode_args, encode_command};
pub use value::{ErrorKind, Value};
