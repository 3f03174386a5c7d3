use super::error::BencodeError;
use super::value::Value;
use std::io::{Cursor, Write};

/// Encodes a value to a freshly allocated byte vector.
///
/// Integers become `i<number>e`, byte strings `<length>:<data>`, lists
/// `l<items>e` and dictionaries `d<key><value>...e`. Dictionary entries are
/// written in stored (insertion) order, not sorted.
///
/// # Examples
///
/// ```
/// use rdht::bencode::{encode, Value};
///
/// assert_eq!(encode(&Value::Integer(42)).unwrap(), b"i42e");
/// assert_eq!(encode(&Value::string("abc")).unwrap(), b"3:abc");
/// ```
pub fn encode(value: &Value) -> Result<Vec<u8>, BencodeError> {
    let mut buf = Vec::new();
    encode_value(value, &mut buf)?;
    Ok(buf)
}

/// Encodes a value into a caller-provided buffer, returning bytes written.
///
/// Fails with [`BencodeError::Overflow`] when the buffer is too small. The
/// buffer contents past the last complete write are unspecified on failure;
/// the caller retries with a larger buffer or drops the message.
pub fn encode_into(value: &Value, buf: &mut [u8]) -> Result<usize, BencodeError> {
    let mut cursor = Cursor::new(buf);
    match encode_value(value, &mut cursor) {
        Ok(()) => Ok(cursor.position() as usize),
        Err(BencodeError::Io(e)) if e.kind() == std::io::ErrorKind::WriteZero => {
            Err(BencodeError::Overflow)
        }
        Err(e) => Err(e),
    }
}

fn encode_value<W: Write>(value: &Value, writer: &mut W) -> Result<(), BencodeError> {
    match value {
        Value::Integer(i) => {
            write!(writer, "i{}e", i)?;
        }
        Value::Bytes(b) => {
            write!(writer, "{}:", b.len())?;
            writer.write_all(b)?;
        }
        Value::List(l) => {
            writer.write_all(b"l")?;
            for item in l {
                encode_value(item, writer)?;
            }
            writer.write_all(b"e")?;
        }
        Value::Dict(d) => {
            writer.write_all(b"d")?;
            for (key, val) in d.iter() {
                write!(writer, "{}:", key.len())?;
                writer.write_all(key)?;
                encode_value(val, writer)?;
            }
            writer.write_all(b"e")?;
        }
    }
    Ok(())
}
