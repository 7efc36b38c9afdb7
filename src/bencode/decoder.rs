use super::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::collections::BTreeMap;
use std::ops::Range;

/// Nesting limit, deep enough for any real metainfo file
const MAX_DEPTH: usize = 64;

/// Decode a complete bencoded document
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let mut decoder = Decoder::new(data);
    let value = decoder.value(0)?;
    decoder.finish()?;
    Ok(value)
}

/// Decode a top-level dictionary and return the raw byte span of every value.
///
/// Used to hash the `info` dictionary exactly as it appears on disk, without
/// re-encoding it.
pub fn dict_spans(data: &[u8]) -> Result<Vec<(Vec<u8>, Range<usize>)>> {
    let mut decoder = Decoder::new(data);
    decoder.expect(b'd')?;

    let mut spans = Vec::new();
    while decoder.peek()? != b'e' {
        let key = decoder.byte_string()?;
        let start = decoder.pos;
        decoder.value(1)?;
        spans.push((key, start..decoder.pos));
    }
    decoder.pos += 1;
    decoder.finish()?;

    Ok(spans)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| error("unexpected end of input"))
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek()? != byte {
            return Err(error(format!(
                "expected '{}' at offset {}",
                byte as char, self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(error(format!(
                "{} trailing bytes after value",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(error("nesting too deep"));
        }

        match self.peek()? {
            b'i' => self.integer().map(BencodeValue::Integer),
            b'0'..=b'9' => self.byte_string().map(BencodeValue::String),
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(BencodeValue::List(list))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.byte_string()?;
                    let value = self.value(depth + 1)?;
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(BencodeValue::Dict(dict))
            }
            c => Err(error(format!(
                "invalid token '{}' at offset {}",
                c as char, self.pos
            ))),
        }
    }

    /// i<digits>e, no leading zeros, no negative zero
    fn integer(&mut self) -> Result<i64> {
        self.expect(b'i')?;
        let digits = self.take_until(b'e')?;

        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty()
            || (unsigned[0] == b'0' && unsigned.len() > 1)
            || digits == b"-0"
        {
            return Err(error("malformed integer"));
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| error("malformed integer"))
    }

    /// <length>:<bytes>
    fn byte_string(&mut self) -> Result<Vec<u8>> {
        let digits = self.take_until(b':')?;
        let len = std::str::from_utf8(digits)
            .ok()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| error("malformed string length"))?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| error("string length exceeds input"))?;

        let bytes = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    /// Consume bytes up to `terminator`, returning them without it
    fn take_until(&mut self, terminator: u8) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == terminator)
            .ok_or_else(|| error(format!("missing '{}'", terminator as char)))?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }
}

fn error(msg: impl Into<String>) -> BittorrentError {
    BittorrentError::BencodeError(msg.into())
}
