//! Bencode codec.
//!
//! The wire format shared with the REPL server:
//!
//! ```text
//! byte string  <len>:<bytes>      4:spam
//! integer      i<digits>e         i-42e
//! list         l<items>e          l4:spami1ee
//! dict         d<key><value>...e  d2:id i1e2:op5:clonee
//! ```
//!
//! Dictionaries are encoded with keys in sorted byte order, so encoding is
//! deterministic. The codec knows nothing about protocol semantics.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_stream, ByteSource, DecodeStream, ReaderSource, StreamDecoder};
pub use encode::{encode, encode_into, encode_json};
pub use error::{EncodingError, ProtocolError, ProtocolErrorKind};
pub use value::{Dict, Value};
