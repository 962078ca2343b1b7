//! Artifact model
//!
//! [`Value`] is the closed set of data exchanged between rules: primitives,
//! filesystem references, collections and named records. Equality and hashing
//! are defined on the canonical byte encoding (see [`canonical`]), so two values
//! are equal exactly when they encode identically, which keeps cache keys
//! stable across processes.
//!
//! ClassPkg and the other JVM build records are conventions over
//! [`Value::Record`]; see [`classpkg`].

pub mod canonical;
pub mod classpkg;

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use canonical::DecodeError;
pub use classpkg::{ClassOrigin, ClassPaths, ClassPkg, CpInfo};

/// Named arguments of a rule invocation
pub type Args = BTreeMap<String, Value>;

/// A value produced or consumed by a rule
///
/// `Clone`, `Drop`, equality and hashing never recurse on the native stack,
/// so arbitrarily deep dependency chains are safe to build and discard.
pub enum Value {
    /// Absent value for nullable arguments
    None,
    Bool(bool),
    Number(i64),
    String(String),
    /// Filesystem path of unspecified kind
    Path(PathBuf),
    /// Path expected to name a regular file
    File(PathBuf),
    /// Path expected to name a directory
    Directory(PathBuf),
    /// Variant of a user-declared enumeration
    Enum { type_name: String, variant: String },
    /// Ordered sequence
    List(Vec<Value>),
    /// Unordered collection, unique by structural equality
    Set(ValueSet),
    /// Fixed-arity positional group
    Tuple(Vec<Value>),
    /// Instance of a user-defined data class
    Record(Record),
}

/// Named record: a type name plus named fields
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub type_name: String,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Set of values with structural uniqueness
///
/// Insertion order is kept for iteration, but equality and encoding ignore it.
#[derive(Debug, Clone, Default)]
pub struct ValueSet {
    items: Vec<Value>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` unless a structurally equal value is already present
    pub fn insert(&mut self, value: Value) -> bool {
        if self.contains(&value) {
            return false;
        }
        self.items.push(value);
        true
    }

    pub fn contains(&self, value: &Value) -> bool {
        let needle = value.canonical_bytes();
        self.items.iter().any(|v| v.canonical_bytes() == needle)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }
}

impl FromIterator<Value> for ValueSet {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let candidates: Vec<Value> = iter.into_iter().collect();
        if candidates.len() < 2 {
            return Self { items: candidates };
        }
        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::with_capacity(candidates.len());
        for value in candidates {
            if seen.insert(value.canonical_bytes()) {
                items.push(value);
            }
        }
        Self { items }
    }
}

impl IntoIterator for ValueSet {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a ValueSet {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn path(p: impl Into<PathBuf>) -> Self {
        Value::Path(p.into())
    }

    pub fn file(p: impl Into<PathBuf>) -> Self {
        Value::File(p.into())
    }

    pub fn dir(p: impl Into<PathBuf>) -> Self {
        Value::Directory(p.into())
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Set(items.into_iter().collect())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn enumeration(type_name: impl Into<String>, variant: impl Into<String>) -> Self {
        Value::Enum {
            type_name: type_name.into(),
            variant: variant.into(),
        }
    }

    /// Short name of the variant, used in argument errors
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Path(_) => "path",
            Value::File(_) => "file",
            Value::Directory(_) => "directory",
            Value::Enum { .. } => "enum",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Tuple(_) => "tuple",
            Value::Record(_) => "record",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any filesystem reference, regardless of its declared kind
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Value::Path(p) | Value::File(p) | Value::Directory(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&Path> {
        match self {
            Value::File(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_directory(&self) -> Option<&Path> {
        match self {
            Value::Directory(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&ValueSet> {
        match self {
            Value::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Record of the given type name
    pub fn as_record_of(&self, type_name: &str) -> Option<&Record> {
        self.as_record().filter(|r| r.type_name == type_name)
    }

    /// Take the set out of a `Set` value
    pub fn into_set(mut self) -> Option<ValueSet> {
        match &mut self {
            Value::Set(set) => Some(std::mem::take(set)),
            _ => None,
        }
    }

    /// Take the items out of a `List` value
    pub fn into_list(mut self) -> Option<Vec<Value>> {
        match &mut self {
            Value::List(items) => Some(std::mem::take(items)),
            _ => None,
        }
    }

    /// Take the record out of a `Record` value
    pub fn into_record(mut self) -> Option<Record> {
        match &mut self {
            Value::Record(r) => Some(std::mem::take(r)),
            _ => None,
        }
    }

    /// Every filesystem reference reachable from this value, in visit order
    pub fn referenced_paths(&self) -> Vec<&Path> {
        let mut paths = Vec::new();
        let mut stack = vec![self];
        while let Some(value) = stack.pop() {
            match value {
                Value::Path(p) | Value::File(p) | Value::Directory(p) => paths.push(p.as_path()),
                Value::List(items) | Value::Tuple(items) => stack.extend(items.iter().rev()),
                Value::Set(set) => stack.extend(set.items.iter().rev()),
                Value::Record(r) => stack.extend(r.fields.values().rev()),
                _ => {}
            }
        }
        paths
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(r)
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(mut child) = pending.pop() {
            child.detach_children(&mut pending);
        }
    }
}

impl Value {
    fn detach_children(&mut self, out: &mut Vec<Value>) {
        match self {
            Value::List(items) | Value::Tuple(items) => out.append(items),
            Value::Set(set) => out.append(&mut set.items),
            Value::Record(r) => out.extend(std::mem::take(&mut r.fields).into_values()),
            _ => {}
        }
    }

    /// Clone of a leaf, or an empty frame for a container
    fn open_clone(&self) -> Result<Value, CloneFrame<'_>> {
        match self {
            Value::None => Ok(Value::None),
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => Ok(Value::Number(*n)),
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Path(p) => Ok(Value::Path(p.clone())),
            Value::File(p) => Ok(Value::File(p.clone())),
            Value::Directory(p) => Ok(Value::Directory(p.clone())),
            Value::Enum { type_name, variant } => Ok(Value::Enum {
                type_name: type_name.clone(),
                variant: variant.clone(),
            }),
            Value::List(items) => Err(CloneFrame::List(items.iter(), Vec::with_capacity(items.len()))),
            Value::Tuple(items) => Err(CloneFrame::Tuple(items.iter(), Vec::with_capacity(items.len()))),
            Value::Set(set) => Err(CloneFrame::Set(set.items.iter(), Vec::with_capacity(set.len()))),
            Value::Record(r) => Err(CloneFrame::Record {
                type_name: &r.type_name,
                src: r.fields.iter(),
                out: BTreeMap::new(),
                pending: None,
            }),
        }
    }
}

enum CloneFrame<'a> {
    List(std::slice::Iter<'a, Value>, Vec<Value>),
    Tuple(std::slice::Iter<'a, Value>, Vec<Value>),
    Set(std::slice::Iter<'a, Value>, Vec<Value>),
    Record {
        type_name: &'a str,
        src: std::collections::btree_map::Iter<'a, String, Value>,
        out: BTreeMap<String, Value>,
        pending: Option<&'a str>,
    },
}

impl<'a> CloneFrame<'a> {
    fn next_child(&mut self) -> Option<&'a Value> {
        match self {
            CloneFrame::List(src, _) | CloneFrame::Tuple(src, _) | CloneFrame::Set(src, _) => src.next(),
            CloneFrame::Record { src, pending, .. } => src.next().map(|(name, value)| {
                *pending = Some(name.as_str());
                value
            }),
        }
    }

    fn accept(&mut self, value: Value) {
        match self {
            CloneFrame::List(_, out) | CloneFrame::Tuple(_, out) | CloneFrame::Set(_, out) => out.push(value),
            CloneFrame::Record { out, pending, .. } => {
                if let Some(name) = pending.take() {
                    out.insert(name.to_string(), value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            CloneFrame::List(_, out) => Value::List(out),
            CloneFrame::Tuple(_, out) => Value::Tuple(out),
            // already unique, so skip re-deduplication
            CloneFrame::Set(_, out) => Value::Set(ValueSet { items: out }),
            CloneFrame::Record { type_name, out, .. } => Value::Record(Record {
                type_name: type_name.to_string(),
                fields: out,
            }),
        }
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        let mut frames = match self.open_clone() {
            Ok(leaf) => return leaf,
            Err(frame) => vec![frame],
        };
        while let Some(top) = frames.last_mut() {
            match top.next_child() {
                Some(child) => match child.open_clone() {
                    Ok(leaf) => top.accept(leaf),
                    Err(frame) => frames.push(frame),
                },
                None => {
                    let done = match frames.pop() {
                        Some(frame) => frame.finish(),
                        None => break,
                    };
                    match frames.last_mut() {
                        Some(parent) => parent.accept(done),
                        None => return done,
                    }
                }
            }
        }
        Value::None
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_bytes() == other.canonical_bytes()
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_bytes().hash(state);
    }
}

impl PartialEq for ValueSet {
    fn eq(&self, other: &Self) -> bool {
        Value::Set(self.clone()) == Value::Set(other.clone())
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        Value::Record(self.clone()) == Value::Record(other.clone())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_display(self, f, 0)
    }
}

/// Nesting depth below which `Display` stops descending
const DISPLAY_DEPTH: usize = 32;

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_display(self, f, 0)
    }
}

fn write_display(value: &Value, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    if depth > DISPLAY_DEPTH {
        return write!(f, "...");
    }
    match value {
        Value::None => write!(f, "none"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Number(n) => write!(f, "{}", n),
        Value::String(s) => write!(f, "{:?}", s),
        Value::Path(p) => write!(f, "path({})", p.display()),
        Value::File(p) => write!(f, "file({})", p.display()),
        Value::Directory(p) => write!(f, "dir({})", p.display()),
        Value::Enum { type_name, variant } => write!(f, "{}.{}", type_name, variant),
        Value::List(items) => write_seq(f, "[", "]", items.iter(), depth),
        Value::Set(set) => write_seq(f, "{", "}", set.iter(), depth),
        Value::Tuple(items) => write_seq(f, "(", ")", items.iter(), depth),
        Value::Record(r) => {
            write!(f, "{}{{", r.type_name)?;
            for (i, (name, field)) in r.fields.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}=", name)?;
                write_display(field, f, depth + 1)?;
            }
            write!(f, "}}")
        }
    }
}

fn write_seq<'a>(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    close: &str,
    items: impl Iterator<Item = &'a Value>,
    depth: usize,
) -> fmt::Result {
    write!(f, "{}", open)?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write_display(item, f, depth + 1)?;
    }
    write!(f, "{}", close)
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.canonical_bytes()))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Value::from_canonical_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}
