//! External term format (`encoding=etf`)
//!
//! Only the subset of terms the gateway exchanges is supported. Terms map onto
//! [`serde_json::Value`] so the rest of the crate handles both encodings the
//! same way.

use crate::error::GatewayError;
use serde_json::{Map, Number, Value};

const FORMAT_VERSION: u8 = 131;

/// Deepest nesting of lists, tuples and maps accepted from the wire.
const MAX_DEPTH: usize = 128;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Encode a value as a versioned term.
pub fn encode(value: &Value) -> Result<Vec<u8>, GatewayError> {
    let mut out = Vec::with_capacity(64);
    out.push(FORMAT_VERSION);
    encode_term(value, &mut out)?;
    Ok(out)
}

/// Decode a versioned term.
pub fn decode(bytes: &[u8]) -> Result<Value, GatewayError> {
    let mut reader = Reader {
        bytes,
        pos: 0,
        depth: 0,
    };
    let version = reader.u8()?;
    if version != FORMAT_VERSION {
        return Err(decode_error(format!("unsupported term version {version}")));
    }

    let value = reader.term()?;
    if reader.pos != bytes.len() {
        return Err(decode_error(format!(
            "{} trailing bytes after term",
            bytes.len() - reader.pos
        )));
    }
    Ok(value)
}

fn encode_term(value: &Value, out: &mut Vec<u8>) -> Result<(), GatewayError> {
    match value {
        Value::Null => encode_atom("nil", out),
        Value::Bool(true) => encode_atom("true", out),
        Value::Bool(false) => encode_atom("false", out),
        Value::Number(number) => encode_number(number, out)?,
        Value::String(text) => {
            out.push(BINARY_EXT);
            out.extend_from_slice(&length(text.len())?.to_be_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        Value::Array(items) => {
            if items.is_empty() {
                out.push(NIL_EXT);
                return Ok(());
            }
            out.push(LIST_EXT);
            out.extend_from_slice(&length(items.len())?.to_be_bytes());
            for item in items {
                encode_term(item, out)?;
            }
            out.push(NIL_EXT);
        }
        Value::Object(map) => {
            out.push(MAP_EXT);
            out.extend_from_slice(&length(map.len())?.to_be_bytes());
            for (key, item) in map {
                out.push(BINARY_EXT);
                out.extend_from_slice(&length(key.len())?.to_be_bytes());
                out.extend_from_slice(key.as_bytes());
                encode_term(item, out)?;
            }
        }
    }
    Ok(())
}

fn encode_atom(name: &str, out: &mut Vec<u8>) {
    // atom names used here are ASCII and short
    out.push(SMALL_ATOM_UTF8_EXT);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

fn encode_number(number: &Number, out: &mut Vec<u8>) -> Result<(), GatewayError> {
    if let Some(n) = number.as_u64() {
        if n <= u64::from(u8::MAX) {
            out.push(SMALL_INTEGER_EXT);
            out.push(n as u8);
        } else if n <= i32::MAX as u64 {
            out.push(INTEGER_EXT);
            out.extend_from_slice(&(n as i32).to_be_bytes());
        } else {
            encode_big(false, n, out);
        }
    } else if let Some(n) = number.as_i64() {
        if n >= i64::from(i32::MIN) {
            out.push(INTEGER_EXT);
            out.extend_from_slice(&(n as i32).to_be_bytes());
        } else {
            encode_big(true, n.unsigned_abs(), out);
        }
    } else if let Some(f) = number.as_f64() {
        out.push(NEW_FLOAT_EXT);
        out.extend_from_slice(&f.to_be_bytes());
    } else {
        return Err(GatewayError::Encode(format!("unsupported number {number}")));
    }
    Ok(())
}

fn encode_big(negative: bool, magnitude: u64, out: &mut Vec<u8>) {
    let digits: Vec<u8> = magnitude
        .to_le_bytes()
        .into_iter()
        .rev()
        .skip_while(|b| *b == 0)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    out.push(SMALL_BIG_EXT);
    out.push(digits.len() as u8);
    out.push(u8::from(negative));
    out.extend_from_slice(&digits);
}

fn length(len: usize) -> Result<u32, GatewayError> {
    u32::try_from(len).map_err(|_| GatewayError::Encode(format!("term of length {len} is too large")))
}

fn decode_error(message: impl Into<String>) -> GatewayError {
    GatewayError::Decode(format!("etf: {}", message.into()))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], GatewayError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| decode_error("unexpected end of term"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, GatewayError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, GatewayError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, GatewayError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn text(&mut self, len: usize) -> Result<String, GatewayError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| decode_error("invalid utf-8"))
    }

    fn term(&mut self) -> Result<Value, GatewayError> {
        if self.depth == MAX_DEPTH {
            return Err(decode_error(format!("term nested deeper than {MAX_DEPTH}")));
        }
        self.depth += 1;
        let value = self.tagged();
        self.depth -= 1;
        value
    }

    fn tagged(&mut self) -> Result<Value, GatewayError> {
        let tag = self.u8()?;
        match tag {
            SMALL_INTEGER_EXT => Ok(Value::from(self.u8()?)),
            INTEGER_EXT => Ok(Value::from(self.u32()? as i32)),
            NEW_FLOAT_EXT => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                float(f64::from_be_bytes(raw))
            }
            FLOAT_EXT => {
                let text = self.text(31)?;
                let parsed = text
                    .trim_end_matches('\0')
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| decode_error("invalid float"))?;
                float(parsed)
            }
            ATOM_EXT | ATOM_UTF8_EXT => {
                let len = self.u16()? as usize;
                Ok(atom(self.text(len)?))
            }
            SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
                let len = self.u8()? as usize;
                Ok(atom(self.text(len)?))
            }
            SMALL_TUPLE_EXT => {
                let arity = self.u8()? as usize;
                self.elements(arity)
            }
            LARGE_TUPLE_EXT => {
                let arity = self.u32()? as usize;
                self.elements(arity)
            }
            NIL_EXT => Ok(Value::Array(Vec::new())),
            STRING_EXT => {
                let len = self.u16()? as usize;
                Ok(Value::Array(
                    self.take(len)?.iter().map(|b| Value::from(*b)).collect(),
                ))
            }
            LIST_EXT => {
                let len = self.u32()? as usize;
                let items = self.elements(len)?;
                // proper lists end in NIL_EXT
                match self.term()? {
                    Value::Array(tail) if tail.is_empty() => Ok(items),
                    _ => Err(decode_error("improper list")),
                }
            }
            BINARY_EXT => {
                let len = self.u32()? as usize;
                Ok(Value::String(self.text(len)?))
            }
            SMALL_BIG_EXT => {
                let len = self.u8()? as usize;
                self.big(len)
            }
            LARGE_BIG_EXT => {
                let len = self.u32()? as usize;
                self.big(len)
            }
            MAP_EXT => {
                let arity = self.u32()? as usize;
                let mut map = Map::new();
                for _ in 0..arity {
                    let key = match self.term()? {
                        Value::String(key) => key,
                        Value::Number(n) => n.to_string(),
                        other => return Err(decode_error(format!("unsupported map key {other}"))),
                    };
                    let value = self.term()?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            other => Err(decode_error(format!("unsupported tag {other}"))),
        }
    }

    fn elements(&mut self, len: usize) -> Result<Value, GatewayError> {
        // never trust the declared length for preallocation
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(self.term()?);
        }
        Ok(Value::Array(items))
    }

    fn big(&mut self, len: usize) -> Result<Value, GatewayError> {
        let negative = self.u8()? != 0;
        let digits = self.take(len)?;
        if digits.iter().skip(8).any(|b| *b != 0) {
            return Err(decode_error("integer exceeds 64 bits"));
        }

        let magnitude = digits
            .iter()
            .take(8)
            .enumerate()
            .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)));

        if !negative {
            return Ok(Value::from(magnitude));
        }
        if magnitude > i64::MAX as u64 + 1 {
            return Err(decode_error("integer exceeds 64 bits"));
        }
        Ok(Value::from((magnitude as i64).wrapping_neg()))
    }
}

fn atom(name: String) -> Value {
    match name.as_str() {
        "nil" | "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(name),
    }
}

fn float(f: f64) -> Result<Value, GatewayError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| decode_error("non-finite float"))
}
