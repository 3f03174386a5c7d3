use super::error::BencodeError;
use super::value::{Dict, Value};
use bytes::Bytes;

/// Maximum nesting depth of lists and dictionaries.
const MAX_DEPTH: usize = 64;

/// Maximum digits in an integer body. An i64 never needs more.
const MAX_INTEGER_DIGITS: usize = 19;

/// Maximum digits in a string length prefix. Caps declared lengths well
/// below anything a UDP datagram could carry.
const MAX_LENGTH_DIGITS: usize = 7;

/// Decodes a single bencoded value from `data`.
///
/// The entire input must be consumed; trailing bytes after the value are an
/// error. Truncated input fails rather than yielding a partial value.
///
/// # Examples
///
/// ```
/// use rdht::bencode::{decode, Value};
///
/// let value = decode(b"d1:ai1ee").unwrap();
/// assert_eq!(value.get(b"a").and_then(Value::as_integer), Some(1));
/// ```
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder::new(data);
    let value = decoder.decode_value(0)?;
    if decoder.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Decoder { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn advance(&mut self) -> Result<u8, BencodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn decode_value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }
        match self.peek()? {
            b'i' => self.decode_integer(),
            b'l' => self.decode_list(depth),
            b'd' => self.decode_dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.decode_bytes()?)),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    fn decode_integer(&mut self) -> Result<Value, BencodeError> {
        self.advance()?; // 'i'
        let start = self.pos;
        let negative = self.peek()? == b'-';
        if negative {
            self.advance()?;
        }
        let digit_start = self.pos;
        while self.peek()? != b'e' {
            let b = self.advance()?;
            if !b.is_ascii_digit() {
                return Err(BencodeError::InvalidInteger(
                    String::from_utf8_lossy(&self.data[start..self.pos]).into_owned(),
                ));
            }
        }
        let digits = &self.data[digit_start..self.pos];
        if digits.is_empty() || digits.len() > MAX_INTEGER_DIGITS {
            return Err(BencodeError::InvalidInteger(
                String::from_utf8_lossy(&self.data[start..self.pos]).into_owned(),
            ));
        }
        // Leading zeros are rejected except for "0" itself; a signed zero
        // is never canonical.
        if digits[0] == b'0' && (negative || digits.len() > 1) {
            return Err(BencodeError::InvalidInteger(
                String::from_utf8_lossy(&self.data[start..self.pos]).into_owned(),
            ));
        }
        let text = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BencodeError::InvalidInteger(String::new()))?;
        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(text.to_owned()))?;
        self.advance()?; // 'e'
        Ok(Value::Integer(value))
    }

    fn decode_bytes(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.advance()?.is_ascii_digit() {
                return Err(BencodeError::InvalidStringLength);
            }
        }
        let digits = &self.data[start..self.pos];
        if digits.is_empty() || digits.len() > MAX_LENGTH_DIGITS {
            return Err(BencodeError::InvalidStringLength);
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;
        self.advance()?; // ':'
        if self.data.len() - self.pos < len {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(bytes)
    }

    fn decode_list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.advance()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.decode_value(depth + 1)?);
        }
        self.advance()?; // 'e'
        Ok(Value::List(items))
    }

    fn decode_dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.advance()?; // 'd'
        let mut dict = Dict::new();
        while self.peek()? != b'e' {
            let key = self.decode_bytes()?;
            let value = self.decode_value(depth + 1)?;
            dict.insert(key, value);
        }
        self.advance()?; // 'e'
        Ok(Value::Dict(dict))
    }
}
