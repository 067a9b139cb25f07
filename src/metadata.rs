//! GGUF header reader
//!
//! Reads the self-describing key/value header of a model file without
//! touching tensor data. Only `uint32` and `string` values are materialized;
//! every other known type is skipped and recorded as [`MetadataEntry::Unknown`].
//!
//! The public entry points never fail. Open and format errors produce an empty
//! [`ModelMetadata`] and a diagnostic line.

use crate::error::{EchoError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// "GGUF" read as a little-endian u32
pub const GGUF_MAGIC: u32 = 0x4655_4747;

const MAX_VERSION: u32 = 3;
const MAX_METADATA_COUNT: u64 = 100_000;
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

const TYPE_UINT8: u32 = 0;
const TYPE_INT8: u32 = 1;
const TYPE_UINT16: u32 = 2;
const TYPE_INT16: u32 = 3;
const TYPE_UINT32: u32 = 4;
const TYPE_INT32: u32 = 5;
const TYPE_FLOAT32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_UINT64: u32 = 10;
const TYPE_INT64: u32 = 11;
const TYPE_FLOAT64: u32 = 12;

/// A typed header value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MetadataEntry {
    UInt32(u32),
    String(String),
    /// Present in the file with a type that is not materialized
    Unknown,
}

impl MetadataEntry {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            MetadataEntry::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataEntry::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, MetadataEntry::Unknown)
    }
}

impl fmt::Display for MetadataEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataEntry::UInt32(v) => write!(f, "{}", v),
            MetadataEntry::String(s) => f.write_str(s),
            MetadataEntry::Unknown => f.write_str("[Unknown Type]"),
        }
    }
}

/// Header attributes keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ModelMetadata {
    entries: HashMap<String, MetadataEntry>,
}

impl ModelMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetadataEntry) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&MetadataEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataEntry)> {
        self.entries.iter()
    }

    /// Keys in sorted order
    pub fn sorted_keys(&self) -> Vec<&String> {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        keys
    }

    /// Maximum context size: the `uint32` value of the first key, in sorted
    /// order, containing `context_length`.
    pub fn max_context_length(&self) -> Option<u32> {
        self.sorted_keys()
            .into_iter()
            .filter(|key| key.contains("context_length"))
            .find_map(|key| self.entries.get(key.as_str()).and_then(MetadataEntry::as_u32))
    }

    /// `model_name`, else `general.name`, else `"UnknownModel"`
    pub fn model_name(&self) -> &str {
        ["model_name", "general.name"]
            .iter()
            .find_map(|key| self.entries.get(*key).and_then(MetadataEntry::as_str))
            .unwrap_or("UnknownModel")
    }

    pub fn into_inner(self) -> HashMap<String, MetadataEntry> {
        self.entries
    }
}

impl From<HashMap<String, MetadataEntry>> for ModelMetadata {
    fn from(entries: HashMap<String, MetadataEntry>) -> Self {
        Self { entries }
    }
}

impl IntoIterator for ModelMetadata {
    type Item = (String, MetadataEntry);
    type IntoIter = std::collections::hash_map::IntoIter<String, MetadataEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Parse a model file header, reporting diagnostics through `tracing`
pub fn parse(path: impl AsRef<Path>) -> ModelMetadata {
    parse_with_diagnostics(path, &mut |msg: &str| tracing::warn!("{}", msg))
}

/// Parse a model file header, reporting each diagnostic line to `diagnostics`
pub fn parse_with_diagnostics(
    path: impl AsRef<Path>,
    diagnostics: &mut dyn FnMut(&str),
) -> ModelMetadata {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            diagnostics(&format!("Failed to open file {}: {}", path.display(), e));
            return ModelMetadata::new();
        }
    };

    match read_metadata(BufReader::new(file), diagnostics) {
        Ok(metadata) => {
            tracing::debug!("{}: {} metadata entries", path.display(), metadata.len());
            metadata
        }
        Err(e) => {
            diagnostics(&format!("Failed to read metadata from {}: {}", path.display(), e));
            ModelMetadata::new()
        }
    }
}

/// Read a GGUF header from `reader`.
///
/// Fails on a bad magic, unsupported version, truncated data or an
/// unknown value type tag that cannot be skipped.
pub fn read_metadata<R: Read>(reader: R, diagnostics: &mut dyn FnMut(&str)) -> Result<ModelMetadata> {
    let mut header = HeaderReader::new(reader);

    let magic = header.u32()?;
    if magic != GGUF_MAGIC {
        return Err(EchoError::FormatError(format!(
            "Invalid GGUF magic: 0x{:08X}, expected 0x{:08X}",
            magic, GGUF_MAGIC
        )));
    }

    let version = header.u32()?;
    if version == 0 || version > MAX_VERSION {
        return Err(EchoError::FormatError(format!(
            "Unsupported GGUF version: {}",
            version
        )));
    }
    header.version = version;

    let _tensor_count = header.count()?;
    let kv_count = header.count()?;
    if kv_count > MAX_METADATA_COUNT {
        return Err(EchoError::FormatError(format!(
            "metadata count {} exceeds maximum {}",
            kv_count, MAX_METADATA_COUNT
        )));
    }

    let mut metadata = ModelMetadata::new();
    for _ in 0..kv_count {
        let key = header.string()?;
        let value_type = header.u32()?;
        let entry = match value_type {
            TYPE_UINT32 => MetadataEntry::UInt32(header.u32()?),
            TYPE_STRING => MetadataEntry::String(header.string()?),
            other => {
                header.skip_value(other)?;
                diagnostics(&format!("Unknown type for key: {}", key));
                MetadataEntry::Unknown
            }
        };
        metadata.insert(key, entry);
    }

    Ok(metadata)
}

struct HeaderReader<R> {
    inner: R,
    version: u32,
}

impl<R: Read> HeaderReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            version: MAX_VERSION,
        }
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf).map_err(truncated)?;
        Ok(buf)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes::<4>()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes::<8>()?))
    }

    /// Counts and lengths are 32-bit in version 1
    fn count(&mut self) -> Result<u64> {
        if self.version == 1 {
            Ok(self.u32()? as u64)
        } else {
            self.u64()
        }
    }

    fn string(&mut self) -> Result<String> {
        let len = self.count()?;
        if len > MAX_STRING_LEN {
            return Err(EchoError::FormatError(format!(
                "string length {} exceeds maximum {}",
                len, MAX_STRING_LEN
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).map_err(truncated)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(n), &mut io::sink())?;
        if copied < n {
            return Err(EchoError::FormatError("unexpected end of header".to_string()));
        }
        Ok(())
    }

    fn skip_string(&mut self) -> Result<()> {
        let len = self.count()?;
        self.skip(len)
    }

    fn skip_value(&mut self, value_type: u32) -> Result<()> {
        match value_type {
            TYPE_STRING => self.skip_string(),
            TYPE_ARRAY => {
                let elem_type = self.u32()?;
                let count = self.count()?;
                match elem_type {
                    TYPE_STRING => {
                        for _ in 0..count {
                            self.skip_string()?;
                        }
                        Ok(())
                    }
                    TYPE_ARRAY => Err(EchoError::FormatError(
                        "nested arrays are not supported".to_string(),
                    )),
                    other => {
                        let size = scalar_size(other)?;
                        let total = count.checked_mul(size).ok_or_else(|| {
                            EchoError::FormatError(format!("array of {} elements overflows", count))
                        })?;
                        self.skip(total)
                    }
                }
            }
            other => self.skip(scalar_size(other)?),
        }
    }
}

fn scalar_size(value_type: u32) -> Result<u64> {
    match value_type {
        TYPE_UINT8 | TYPE_INT8 | TYPE_BOOL => Ok(1),
        TYPE_UINT16 | TYPE_INT16 => Ok(2),
        TYPE_UINT32 | TYPE_INT32 | TYPE_FLOAT32 => Ok(4),
        TYPE_UINT64 | TYPE_INT64 | TYPE_FLOAT64 => Ok(8),
        other => Err(EchoError::FormatError(format!(
            "invalid value type tag {}",
            other
        ))),
    }
}

fn truncated(e: io::Error) -> EchoError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        EchoError::FormatError("unexpected end of header".to_string())
    } else {
        EchoError::IoError(e)
    }
}
