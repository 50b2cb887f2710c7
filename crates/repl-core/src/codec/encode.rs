use super::error::EncodingError;
use super::value::Value;
use std::io::Write;

/// Encode a value into a fresh buffer.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Append the encoding of `value` to `out`.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(bytes) => write_bytes(bytes, out),
        Value::Int(n) => {
            // Writing into a Vec cannot fail.
            let _ = write!(out, "i{}e", n);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            for (key, value) in dict {
                write_bytes(key, out);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

/// Encode an arbitrary JSON value, rejecting shapes bencode cannot carry.
pub fn encode_json(json: serde_json::Value) -> Result<Vec<u8>, EncodingError> {
    Value::try_from(json).map(|value| encode(&value))
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    let _ = write!(out, "{}:", bytes.len());
    out.extend_from_slice(bytes);
}
