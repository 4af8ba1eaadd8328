//! Length encodings shared by the WAL record framing.

pub mod varint;

pub use varint::{decode_varint, encode_varint, varint_len};
