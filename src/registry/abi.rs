//! Minimal Solidity ABI codec for the registry's entry points.
//!
//! Only the handful of types the registry uses are supported:
//! `uint256` (restricted to values that fit a `u64`), `bool`,
//! `string`, `bytes` and `string[]`.

use crate::error::RegistryError;

const WORD: usize = 32;

pub const GET_MEMBERS_COUNT: [u8; 4] = [0x09, 0x77, 0x2f, 0x8f];
pub const MEMBERS: [u8; 4] = [0x5d, 0xaf, 0x08, 0xca];
pub const GET_MEMBER_DETAILS: [u8; 4] = [0xfe, 0x1d, 0x3f, 0xd2];
pub const GET_MEMBER_IMAGES: [u8; 4] = [0x23, 0x31, 0x26, 0x62];
pub const GET_IMAGES_COUNT: [u8; 4] = [0x87, 0x42, 0x99, 0x3d];
pub const IMAGES: [u8; 4] = [0x84, 0x85, 0x64, 0x82];
pub const GET_IMAGE_DETAILS: [u8; 4] = [0x1b, 0x73, 0xae, 0xff];
/// `addImage(string,uint256)`
pub const ADD_IMAGE: [u8; 4] = [0x5b, 0xac, 0x6c, 0xd3];
/// `addImage(string,bytes)`
pub const ADD_IMAGE_SEALED: [u8; 4] = [0xbf, 0x3d, 0xbd, 0x38];
pub const REMOVE_IMAGE: [u8; 4] = [0x7b, 0xe5, 0x26, 0x09];

/// A single call argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(u64),
    String(String),
    Bytes(Vec<u8>),
}

/// Encodes a call: selector followed by the head/tail encoded arguments.
pub fn encode_call(selector: [u8; 4], args: &[Token]) -> Vec<u8> {
    let mut out = selector.to_vec();
    let mut tail = Vec::new();
    let head_len = args.len() * WORD;
    for arg in args {
        match arg {
            Token::Uint(v) => out.extend_from_slice(&uint_word(*v)),
            Token::String(s) => {
                out.extend_from_slice(&uint_word((head_len + tail.len()) as u64));
                push_dynamic(&mut tail, s.as_bytes());
            }
            Token::Bytes(b) => {
                out.extend_from_slice(&uint_word((head_len + tail.len()) as u64));
                push_dynamic(&mut tail, b);
            }
        }
    }
    out.extend_from_slice(&tail);
    out
}

pub fn uint_word(v: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&v.to_be_bytes());
    word
}

fn push_dynamic(tail: &mut Vec<u8>, data: &[u8]) {
    tail.extend_from_slice(&uint_word(data.len() as u64));
    tail.extend_from_slice(data);
    let pad = (WORD - data.len() % WORD) % WORD;
    tail.extend(std::iter::repeat(0u8).take(pad));
}

/// Reads values out of ABI-encoded return data.
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn word_at(&self, offset: usize) -> Result<&'a [u8], RegistryError> {
        offset
            .checked_add(WORD)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| RegistryError::Decode(format!("return data too short for word at {offset}")))
    }

    fn uint_at(&self, offset: usize) -> Result<u64, RegistryError> {
        let word = self.word_at(offset)?;
        if word[..WORD - 8].iter().any(|b| *b != 0) {
            return Err(RegistryError::Decode("uint256 value does not fit in 64 bits".into()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&word[WORD - 8..]);
        Ok(u64::from_be_bytes(buf))
    }

    fn usize_at(&self, offset: usize) -> Result<usize, RegistryError> {
        usize::try_from(self.uint_at(offset)?)
            .map_err(|_| RegistryError::Decode("offset out of range".into()))
    }

    fn bytes_at(&self, offset: usize) -> Result<&'a [u8], RegistryError> {
        let len = self.usize_at(offset)?;
        let start = add_offset(offset, WORD)?;
        start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| RegistryError::Decode(format!("dynamic value of {len} bytes truncated")))
    }

    /// `uint256` in head slot `index`.
    pub fn uint(&self, index: usize) -> Result<u64, RegistryError> {
        self.uint_at(index * WORD)
    }

    /// `bool` in head slot `index`.
    pub fn boolean(&self, index: usize) -> Result<bool, RegistryError> {
        match self.uint(index)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(RegistryError::Decode(format!("invalid bool value {v}"))),
        }
    }

    /// `bytes` whose offset lives in head slot `index`.
    pub fn bytes(&self, index: usize) -> Result<Vec<u8>, RegistryError> {
        let offset = self.usize_at(index * WORD)?;
        Ok(self.bytes_at(offset)?.to_vec())
    }

    /// `string` whose offset lives in head slot `index`.
    pub fn string(&self, index: usize) -> Result<String, RegistryError> {
        let offset = self.usize_at(index * WORD)?;
        decode_utf8(self.bytes_at(offset)?)
    }

    /// `string[]` whose offset lives in head slot `index`.
    pub fn string_array(&self, index: usize) -> Result<Vec<String>, RegistryError> {
        let offset = self.usize_at(index * WORD)?;
        let len = self.usize_at(offset)?;
        let base = add_offset(offset, WORD)?;
        let mut out = Vec::with_capacity(len.min(1024));
        for i in 0..len {
            let slot = i
                .checked_mul(WORD)
                .ok_or_else(|| RegistryError::Decode("array length out of range".into()))?;
            let rel = self.usize_at(add_offset(base, slot)?)?;
            out.push(decode_utf8(self.bytes_at(add_offset(base, rel)?)?)?);
        }
        Ok(out)
    }
}

fn add_offset(base: usize, rel: usize) -> Result<usize, RegistryError> {
    base.checked_add(rel)
        .ok_or_else(|| RegistryError::Decode(format!("offset {rel} past {base} overflows")))
}

fn decode_utf8(bytes: &[u8]) -> Result<String, RegistryError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| RegistryError::Decode(e.to_string()))
}

/// Parses `0x`-prefixed hex as returned by the node.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, RegistryError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| RegistryError::Decode(e.to_string()))
}

pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}
