use super::*;

#[test]
fn decode_integer() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn decode_integer_rejects_malformed() {
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i4x2e").is_err());
    assert!(decode(b"i007e").is_err());
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i-007e").is_err());
    // More digits than any i64 needs.
    assert!(decode(b"i12345678901234567890e").is_err());
}

#[test]
fn decode_string() {
    assert_eq!(decode(b"3:abc").unwrap(), Value::string("abc"));
    assert_eq!(decode(b"0:").unwrap(), Value::string(""));
}

#[test]
fn decode_string_rejects_oversized_prefix() {
    // Eight digits in the length prefix exceeds the cap.
    assert!(decode(b"99999999:x").is_err());
}

#[test]
fn decode_string_rejects_truncated_body() {
    assert!(decode(b"5:ab").is_err());
}

#[test]
fn decode_list() {
    let value = decode(b"li1e1:ae").unwrap();
    let list = value.as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0], Value::Integer(1));
    assert_eq!(list[1], Value::string("a"));
}

#[test]
fn decode_dict() {
    let value = decode(b"d1:ai1ee").unwrap();
    assert_eq!(value.get(b"a").and_then(Value::as_integer), Some(1));
}

#[test]
fn decode_fails_closed_on_truncation() {
    assert!(decode(b"d1:t").is_err());
    assert!(decode(b"li1e").is_err());
    assert!(decode(b"i42").is_err());
}

#[test]
fn decode_rejects_trailing_data() {
    assert!(decode(b"i1eextra").is_err());
}

#[test]
fn decode_rejects_excessive_nesting() {
    let mut data = Vec::new();
    data.extend(std::iter::repeat(b'l').take(200));
    data.extend(std::iter::repeat(b'e').take(200));
    assert!(decode(&data).is_err());
}

#[test]
fn encode_preserves_dict_insertion_order() {
    let mut dict = Dict::new();
    dict.insert_str("z", Value::Integer(1));
    dict.insert_str("a", Value::Integer(2));
    let encoded = encode(&Value::Dict(dict)).unwrap();
    assert_eq!(encoded, b"d1:zi1e1:ai2ee");
}

#[test]
fn encode_round_trip() {
    let mut dict = Dict::new();
    dict.insert_str("t", Value::string("\x01"));
    dict.insert_str("y", Value::string("q"));
    dict.insert_str("q", Value::string("ping"));
    dict.insert_str(
        "a",
        Value::Dict({
            let mut args = Dict::new();
            args.insert_str("id", Value::Bytes(bytes::Bytes::from(vec![0xab; 20])));
            args
        }),
    );
    let original = Value::Dict(dict);
    let encoded = encode(&original).unwrap();
    assert_eq!(decode(&encoded).unwrap(), original);
}

#[test]
fn encode_into_reports_overflow() {
    let value = Value::string("hello world");
    let mut small = [0u8; 4];
    assert!(matches!(encode_into(&value, &mut small), Err(BencodeError::Overflow)));

    let mut big = [0u8; 64];
    let n = encode_into(&value, &mut big).unwrap();
    assert_eq!(&big[..n], b"11:hello world");
}
