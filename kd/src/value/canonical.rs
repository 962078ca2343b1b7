//! Canonical binary encoding of [`Value`]
//!
//! The same bytes serve as the wire form (hex inside JSON), the cached result
//! form, and the input to fingerprints. Layout:
//!
//! ```text
//! value   := version:u8 item
//! item    := tag:u8 payload
//! string  := len:u32be utf8-bytes
//! List/Tuple := count:u32be item*
//! Set     := count:u32be item*          (items ascending by encoding, deduplicated)
//! Record  := type:string count:u32be (name:string item)*   (names ascending)
//! ```
//!
//! Both directions run on explicit work stacks.

use std::collections::BTreeMap;

use thiserror::Error;

use super::{Record, Value, ValueSet};

/// Leading byte of every encoding; bump when the layout changes
pub const FORMAT_VERSION: u8 = 1;

const TAG_NONE: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_PATH: u8 = 5;
const TAG_FILE: u8 = 6;
const TAG_DIRECTORY: u8 = 7;
const TAG_ENUM: u8 = 8;
const TAG_LIST: u8 = 9;
const TAG_SET: u8 = 10;
const TAG_TUPLE: u8 = 11;
const TAG_RECORD: u8 = 12;

/// Errors decoding canonical bytes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported value format version {0}")]
    UnsupportedVersion(u8),

    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),

    #[error("unknown value tag {tag} at byte {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("invalid utf-8 in string at byte {0}")]
    InvalidUtf8(usize),

    #[error("duplicate record field {0:?}")]
    DuplicateField(String),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

impl Value {
    /// Canonical encoding; structurally equal values encode identically
    pub fn canonical_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    /// Inverse of [`Value::canonical_bytes`]
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Value, DecodeError> {
        decode(bytes)
    }
}

enum Step<'a> {
    Visit(&'a Value),
    SetItem(&'a Value),
    FieldName(&'a str),
    SealSet { start: usize },
}

fn encode(root: &Value) -> Vec<u8> {
    let mut out = vec![FORMAT_VERSION];
    let mut steps = vec![Step::Visit(root)];
    // item start offsets of every set still open
    let mut open_sets: Vec<Vec<usize>> = Vec::new();

    while let Some(step) = steps.pop() {
        match step {
            Step::Visit(value) => visit(value, &mut out, &mut steps, &mut open_sets),
            Step::SetItem(value) => {
                if let Some(offsets) = open_sets.last_mut() {
                    offsets.push(out.len());
                }
                visit(value, &mut out, &mut steps, &mut open_sets);
            }
            Step::FieldName(name) => put_str(&mut out, name),
            Step::SealSet { start } => {
                let offsets = open_sets.pop().unwrap_or_default();
                seal_set(&mut out, start, &offsets);
            }
        }
    }
    out
}

fn visit<'a>(value: &'a Value, out: &mut Vec<u8>, steps: &mut Vec<Step<'a>>, open_sets: &mut Vec<Vec<usize>>) {
    match value {
        Value::None => out.push(TAG_NONE),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            put_str(out, s);
        }
        Value::Path(p) => {
            out.push(TAG_PATH);
            put_str(out, &p.to_string_lossy());
        }
        Value::File(p) => {
            out.push(TAG_FILE);
            put_str(out, &p.to_string_lossy());
        }
        Value::Directory(p) => {
            out.push(TAG_DIRECTORY);
            put_str(out, &p.to_string_lossy());
        }
        Value::Enum { type_name, variant } => {
            out.push(TAG_ENUM);
            put_str(out, type_name);
            put_str(out, variant);
        }
        Value::List(items) => {
            out.push(TAG_LIST);
            put_len(out, items.len());
            steps.extend(items.iter().rev().map(Step::Visit));
        }
        Value::Tuple(items) => {
            out.push(TAG_TUPLE);
            put_len(out, items.len());
            steps.extend(items.iter().rev().map(Step::Visit));
        }
        Value::Set(set) => {
            out.push(TAG_SET);
            put_len(out, 0);
            steps.push(Step::SealSet { start: out.len() });
            open_sets.push(Vec::with_capacity(set.len()));
            steps.extend(set.iter().rev().map(Step::SetItem));
        }
        Value::Record(record) => {
            out.push(TAG_RECORD);
            put_str(out, &record.type_name);
            put_len(out, record.fields.len());
            for (name, field) in record.fields.iter().rev() {
                steps.push(Step::Visit(field));
                steps.push(Step::FieldName(name));
            }
        }
    }
}

/// Order the items after `start` by encoding, drop duplicates, patch the count
///
/// Items that are already strictly ascending stay where they are.
fn seal_set(out: &mut Vec<u8>, start: usize, offsets: &[usize]) {
    let bounds: Vec<(usize, usize)> = offsets
        .iter()
        .enumerate()
        .map(|(i, &from)| (from, offsets.get(i + 1).copied().unwrap_or(out.len())))
        .collect();

    let ascending = bounds
        .windows(2)
        .all(|w| out[w[0].0..w[0].1] < out[w[1].0..w[1].1]);

    let count = if ascending {
        bounds.len()
    } else {
        let mut items: Vec<Vec<u8>> = bounds.iter().map(|&(from, to)| out[from..to].to_vec()).collect();
        items.sort();
        items.dedup();
        out.truncate(start);
        for item in &items {
            out.extend_from_slice(item);
        }
        items.len()
    };

    out[start - 4..start].copy_from_slice(&(count as u32).to_be_bytes());
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u32).to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::UnexpectedEnd(self.pos))?;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::UnexpectedEnd(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn len(&mut self) -> Result<usize, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_be_bytes(buf))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.len()?;
        let at = self.pos;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| DecodeError::InvalidUtf8(at))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

enum Frame {
    List { remaining: usize, items: Vec<Value> },
    Tuple { remaining: usize, items: Vec<Value> },
    Set { remaining: usize, items: Vec<Value> },
    Record {
        type_name: String,
        remaining: usize,
        fields: BTreeMap<String, Value>,
        pending: Option<String>,
    },
}

impl Frame {
    /// Add a finished child; returns the container once it is complete
    fn push(&mut self, value: Value) -> Result<Option<Value>, DecodeError> {
        match self {
            Frame::List { remaining, items } | Frame::Tuple { remaining, items } | Frame::Set { remaining, items } => {
                items.push(value);
                *remaining -= 1;
            }
            Frame::Record {
                remaining,
                fields,
                pending,
                ..
            } => {
                let name = pending.take().unwrap_or_default();
                if fields.contains_key(&name) {
                    return Err(DecodeError::DuplicateField(name));
                }
                fields.insert(name, value);
                *remaining -= 1;
            }
        }
        if self.remaining() > 0 {
            return Ok(None);
        }
        Ok(Some(match self {
            Frame::List { items, .. } => Value::List(std::mem::take(items)),
            Frame::Tuple { items, .. } => Value::Tuple(std::mem::take(items)),
            Frame::Set { items, .. } => Value::Set(std::mem::take(items).into_iter().collect::<ValueSet>()),
            Frame::Record { type_name, fields, .. } => Value::Record(Record {
                type_name: std::mem::take(type_name),
                fields: std::mem::take(fields),
            }),
        }))
    }

    fn remaining(&self) -> usize {
        match self {
            Frame::List { remaining, .. }
            | Frame::Tuple { remaining, .. }
            | Frame::Set { remaining, .. }
            | Frame::Record { remaining, .. } => *remaining,
        }
    }
}

fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let mut r = Reader { bytes, pos: 0 };
    let version = r.u8()?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let mut frames: Vec<Frame> = Vec::new();
    loop {
        if let Some(Frame::Record { pending, .. }) = frames.last_mut()
            && pending.is_none()
        {
            *pending = Some(r.string()?);
        }

        let offset = r.pos;
        let mut value = match r.u8()? {
            TAG_NONE => Value::None,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_NUMBER => Value::Number(r.i64()?),
            TAG_STRING => Value::String(r.string()?),
            TAG_PATH => Value::Path(r.string()?.into()),
            TAG_FILE => Value::File(r.string()?.into()),
            TAG_DIRECTORY => Value::Directory(r.string()?.into()),
            TAG_ENUM => {
                let type_name = r.string()?;
                let variant = r.string()?;
                Value::Enum { type_name, variant }
            }
            tag @ (TAG_LIST | TAG_TUPLE | TAG_SET) => {
                let n = r.len()?;
                if n == 0 {
                    match tag {
                        TAG_LIST => Value::List(Vec::new()),
                        TAG_TUPLE => Value::Tuple(Vec::new()),
                        _ => Value::Set(ValueSet::new()),
                    }
                } else {
                    let items = Vec::with_capacity(n.min(r.remaining()));
                    frames.push(match tag {
                        TAG_LIST => Frame::List { remaining: n, items },
                        TAG_TUPLE => Frame::Tuple { remaining: n, items },
                        _ => Frame::Set { remaining: n, items },
                    });
                    continue;
                }
            }
            TAG_RECORD => {
                let type_name = r.string()?;
                let n = r.len()?;
                if n == 0 {
                    Value::Record(Record::new(type_name))
                } else {
                    frames.push(Frame::Record {
                        type_name,
                        remaining: n,
                        fields: BTreeMap::new(),
                        pending: None,
                    });
                    continue;
                }
            }
            tag => return Err(DecodeError::UnknownTag { tag, offset }),
        };

        // hand the finished value up through every container it completes
        loop {
            let Some(frame) = frames.last_mut() else {
                if r.remaining() > 0 {
                    return Err(DecodeError::TrailingBytes(r.remaining()));
                }
                return Ok(value);
            };
            match frame.push(value)? {
                Some(done) => {
                    frames.pop();
                    value = done;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classpkg_like(depth: usize) -> Value {
        let mut v = Value::from(Record::new("leaf").with("n", Value::Number(0)));
        for i in 0..depth {
            v = Value::from(
                Record::new("node")
                    .with("n", Value::from(i as i64))
                    .with("deps", Value::set([v])),
            );
        }
        v
    }

    #[test]
    fn test_decode_inverts_encode() {
        let v = Value::from(
            Record::new("jvm.ClassesInfo")
                .with("classDirs", Value::set([Value::dir("/out"), Value::dir("/gen")]))
                .with("resDirs", Value::set([]))
                .with("srcs", Value::None)
                .with("mode", Value::enumeration("Mode", "fast"))
                .with("pair", Value::Tuple(vec![Value::Number(-7), Value::path("rel/p")]))
                .with("flags", Value::list([Value::from(true), Value::from(false)])),
        );
        let bytes = v.canonical_bytes();
        assert_eq!(bytes[0], FORMAT_VERSION);
        assert_eq!(Value::from_canonical_bytes(&bytes).unwrap(), v);
    }

    #[test]
    fn test_nested_sets_canonicalize() {
        let a = Value::set([Value::set([Value::Number(1), Value::Number(2)]), Value::set([Value::Number(3)])]);
        let b = Value::set([Value::set([Value::Number(3)]), Value::set([Value::Number(2), Value::Number(1)])]);
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_deep_chain_round_trips() {
        let v = classpkg_like(20_000);
        let bytes = v.canonical_bytes();
        let back = Value::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(back.canonical_bytes(), bytes);
        let copy = back.clone();
        assert_eq!(copy, v);
    }

    #[test]
    fn test_rejects_unknown_version() {
        assert_eq!(
            Value::from_canonical_bytes(&[FORMAT_VERSION + 1, TAG_NONE]),
            Err(DecodeError::UnsupportedVersion(FORMAT_VERSION + 1))
        );
    }

    #[test]
    fn test_rejects_truncated_and_trailing_input() {
        let bytes = Value::list([Value::from("abc")]).canonical_bytes();
        assert!(matches!(
            Value::from_canonical_bytes(&bytes[..bytes.len() - 1]),
            Err(DecodeError::UnexpectedEnd(_))
        ));

        let mut extra = Value::None.canonical_bytes();
        extra.push(0);
        assert_eq!(Value::from_canonical_bytes(&extra), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_rejects_unknown_tag() {
        assert!(matches!(
            Value::from_canonical_bytes(&[FORMAT_VERSION, 99]),
            Err(DecodeError::UnknownTag { tag: 99, offset: 1 })
        ));
    }

    #[test]
    fn test_huge_declared_count_fails_cleanly() {
        let bytes = [FORMAT_VERSION, TAG_LIST, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(Value::from_canonical_bytes(&bytes), Err(DecodeError::UnexpectedEnd(_))));
    }

    proptest! {
        #[test]
        fn prop_set_encoding_ignores_order(items in prop::collection::vec(any::<i64>(), 0..24)) {
            let forward = Value::set(items.iter().copied().map(Value::from));
            let backward = Value::set(items.iter().rev().copied().map(Value::from));
            prop_assert_eq!(forward.canonical_bytes(), backward.canonical_bytes());
        }

        #[test]
        fn prop_strings_survive_decoding(s in ".*") {
            let v = Value::list([Value::from(s.as_str()), Value::file(s.as_str())]);
            prop_assert_eq!(Value::from_canonical_bytes(&v.canonical_bytes()).unwrap(), v);
        }
    }
}
