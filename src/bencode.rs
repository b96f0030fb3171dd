//! Bencode, the binary encoding used by .torrent files and trackers.
//!
//! The decoder only accepts canonical input: integers without superfluous
//! zeros and dictionaries whose keys appear in ascending byte order, exactly
//! once. The encoder always emits canonical form. Together these guarantee
//! `encode(decode(b)) == b` for every accepted input, which is what allows
//! the info hash to be computed from a re-encoded `info` dictionary.

use std::collections::BTreeMap;

use crate::error::Error;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `i<digits>e`
    Int(i64),
    /// `<len>:<bytes>`, not guaranteed to be UTF-8.
    Str(Vec<u8>),
    /// `l<values>e`
    List(Vec<Value>),
    /// `d<key-value pairs>e`, keys in ascending byte order.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// Look a key up, if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

/// Decode a single bencoded value spanning the entire input.
pub fn decode(buf: &[u8]) -> Result<Value, Error> {
    let mut pos = 0;
    let value = decode_value(buf, &mut pos)?;

    if pos != buf.len() {
        return Err(Error::BencodeTrailing);
    }

    Ok(value)
}

/// Encode a value into canonical bencode form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn decode_value(buf: &[u8], pos: &mut usize) -> Result<Value, Error> {
    match buf.get(*pos) {
        None => Err(Error::BencodeEof),
        Some(b'i') => decode_int(buf, pos),
        Some(b'l') => decode_list(buf, pos),
        Some(b'd') => decode_dict(buf, pos),
        Some(b'0'..=b'9') => decode_str(buf, pos).map(Value::Str),
        Some(&b) => Err(Error::BencodeUnexpected(b, *pos)),
    }
}

fn decode_int(buf: &[u8], pos: &mut usize) -> Result<Value, Error> {
    *pos += 1; // 'i'

    let start = *pos;
    while *pos < buf.len() && buf[*pos] != b'e' {
        *pos += 1;
    }
    if *pos >= buf.len() {
        return Err(Error::BencodeEof);
    }

    let digits = &buf[start..*pos];
    *pos += 1; // 'e'

    let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
    match unsigned {
        // only the literal `0`, never `-0` or a zero-padded number
        [] => return Err(Error::BencodeInteger),
        [b'0'] if digits[0] == b'-' => return Err(Error::BencodeInteger),
        [b'0', _, ..] => return Err(Error::BencodeInteger),
        _ => {}
    }

    let text = std::str::from_utf8(digits).map_err(|_| Error::BencodeInteger)?;
    let n = text.parse::<i64>().map_err(|_| Error::BencodeInteger)?;

    Ok(Value::Int(n))
}

fn decode_str(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>, Error> {
    let start = *pos;
    while *pos < buf.len() && buf[*pos] != b':' {
        *pos += 1;
    }
    if *pos >= buf.len() {
        return Err(Error::BencodeEof);
    }

    let digits = &buf[start..*pos];
    // a zero-padded length would not survive re-encoding byte-identically
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(Error::BencodeStringLength);
    }
    let len = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(Error::BencodeStringLength)?;

    *pos += 1; // ':'

    if buf.len() - *pos < len {
        return Err(Error::BencodeEof);
    }

    let bytes = buf[*pos..*pos + len].to_vec();
    *pos += len;

    Ok(bytes)
}

fn decode_list(buf: &[u8], pos: &mut usize) -> Result<Value, Error> {
    *pos += 1; // 'l'

    let mut items = Vec::new();
    loop {
        match buf.get(*pos) {
            None => return Err(Error::BencodeEof),
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::List(items));
            }
            Some(_) => items.push(decode_value(buf, pos)?),
        }
    }
}

fn decode_dict(buf: &[u8], pos: &mut usize) -> Result<Value, Error> {
    *pos += 1; // 'd'

    let mut dict = BTreeMap::new();
    let mut prev_key: Option<Vec<u8>> = None;

    loop {
        match buf.get(*pos) {
            None => return Err(Error::BencodeEof),
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::Dict(dict));
            }
            Some(b'0'..=b'9') => {
                let key = decode_str(buf, pos)?;

                // strictly ascending also rules out duplicates
                if prev_key.as_deref().is_some_and(|prev| prev >= &key[..]) {
                    return Err(Error::BencodeKeyOrder);
                }

                let value = decode_value(buf, pos)?;
                prev_key = Some(key.clone());
                dict.insert(key, value);
            }
            Some(_) => return Err(Error::BencodeKey),
        }
    }
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Str(bytes) => encode_str(bytes, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            // BTreeMap iterates in ascending key order, the canonical form
            for (key, value) in dict {
                encode_str(key, out);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_str(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
