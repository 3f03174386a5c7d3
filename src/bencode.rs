//! Bencode-style wire object codec.
//!
//! The DHT speaks a length-prefixed textual-binary encoding of four value
//! kinds: integers (`i42e`), byte strings (`4:spam`), lists (`l...e`) and
//! dictionaries (`d...e`). The same codec serializes the persisted bootstrap
//! cache.
//!
//! Unlike strictly canonical bencode, dictionaries here preserve *insertion*
//! order: entries are encoded in the order they were stored, and decoding
//! keeps the order found on the wire. Interoperability tests depend on this.
//!
//! # Examples
//!
//! ```
//! use rdht::bencode::{decode, encode, Dict, Value};
//!
//! let value = decode(b"d1:ai1ee").unwrap();
//! assert_eq!(value.get(b"a").and_then(|v| v.as_integer()), Some(1));
//!
//! let mut dict = Dict::new();
//! dict.insert_str("a", Value::Integer(1));
//! assert_eq!(encode(&Value::Dict(dict)).unwrap(), b"d1:ai1ee");
//! ```

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::{Dict, Value};

#[cfg(test)]
mod tests;
