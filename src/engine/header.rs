//! Self-describing text headers with in-place record counters.
//!
//! A header is a block of `header.<key> = <value>;` lines padded with spaces to a
//! multiple of [`HEADER_ALIGN`] bytes. The first line is always `header_bytes`, so
//! a reader can find where the payload starts from the first kilobyte alone.
//!
//! Counter fields are written as fixed-width, zero-padded decimals. Their byte
//! offsets never change, so [`CountedFile`] can seek back and overwrite them while
//! the payload keeps growing. A file cut short at any point still has a parseable
//! header and a (possibly stale) count.

use crate::error::{RecordError, RecordResult};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Header sizes are rounded up to a multiple of this.
pub const HEADER_ALIGN: usize = 1024;

/// Digits in a counter field.
pub const COUNTER_WIDTH: usize = 20;

const SIZE_WIDTH: usize = 10;
const SIZE_KEY: &str = "header_bytes";

/// Ordered key/value header under construction.
#[derive(Debug, Clone, Default)]
pub struct TextHeader {
    fields: Vec<(String, String)>,
    counters: Vec<String>,
}

/// A rendered header plus the byte offsets of its counter values.
#[derive(Debug, Clone)]
pub struct RenderedHeader {
    /// Header bytes, a multiple of [`HEADER_ALIGN`] long
    pub bytes: Vec<u8>,
    /// Offset of each counter value, in declaration order
    pub counter_offsets: Vec<u64>,
}

impl TextHeader {
    /// Empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plain field.
    pub fn field(&mut self, key: &str, value: impl ToString) -> &mut Self {
        let value = value.to_string().replace(['\n', ';'], " ");
        self.fields.push((key.to_string(), value));
        self
    }

    /// Append a counter field, initially zero.
    pub fn counter(&mut self, key: &str) -> &mut Self {
        self.counters.push(key.to_string());
        self
    }

    /// Lay the header out.
    pub fn render(&self) -> RenderedHeader {
        let mut text = format!("header.{SIZE_KEY} = {:0SIZE_WIDTH$};\n", 0);
        for (key, value) in &self.fields {
            text.push_str(&format!("header.{key} = {value};\n"));
        }

        let mut counter_offsets = Vec::with_capacity(self.counters.len());
        for key in &self.counters {
            let prefix = format!("header.{key} = ");
            counter_offsets.push((text.len() + prefix.len()) as u64);
            text.push_str(&prefix);
            text.push_str(&format!("{:0COUNTER_WIDTH$};\n", 0));
        }

        // at least one byte of padding so the block always ends in a newline
        let total = (text.len() + 1).div_ceil(HEADER_ALIGN) * HEADER_ALIGN;
        let size_line = format!("header.{SIZE_KEY} = {total:0SIZE_WIDTH$};\n");
        text.replace_range(..size_line.len(), &size_line);

        let mut bytes = text.into_bytes();
        bytes.resize(total - 1, b' ');
        bytes.push(b'\n');
        RenderedHeader {
            bytes,
            counter_offsets,
        }
    }
}

/// Parsed header fields.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderFields {
    /// Payload offset
    pub header_bytes: u64,
    fields: Vec<(String, String)>,
}

impl HeaderFields {
    /// Parse a header block.
    pub fn parse(bytes: &[u8]) -> RecordResult<Self> {
        let text = String::from_utf8_lossy(bytes);
        let mut fields = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line
                .strip_prefix("header.")
                .and_then(|l| l.strip_suffix(';'))
                .and_then(|l| l.split_once(" = "))
            else {
                return Err(RecordError::Configuration(format!(
                    "malformed header line '{line}'"
                )));
            };
            fields.push((key.to_string(), value.to_string()));
        }

        let header_bytes = fields
            .iter()
            .find(|(k, _)| k == SIZE_KEY)
            .and_then(|(_, v)| v.parse().ok())
            .ok_or_else(|| RecordError::Configuration("header has no header_bytes".into()))?;
        Ok(Self {
            header_bytes,
            fields,
        })
    }

    /// Read and parse the header at the start of `path`.
    pub fn read(path: impl AsRef<Path>) -> RecordResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| RecordError::fs(path, e))?;
        let mut first = vec![0u8; HEADER_ALIGN];
        file.read_exact(&mut first)
            .map_err(|e| RecordError::fs(path, e))?;

        let size_line = first
            .split(|&b| b == b'\n')
            .next()
            .unwrap_or_default();
        let size = Self::parse(size_line)?.header_bytes as usize;
        if size > HEADER_ALIGN {
            first.resize(size, 0);
            file.read_exact(&mut first[HEADER_ALIGN..])
                .map_err(|e| RecordError::fs(path, e))?;
        }
        Self::parse(&first[..size.max(HEADER_ALIGN).min(first.len())])
    }

    /// Raw value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Integer value of `key`.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.parse().ok()
    }

    /// All fields in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Create `path`, failing if it already exists.
pub(crate) fn create_fresh(path: &Path) -> RecordResult<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| RecordError::fs(path, e))
}

/// An output file with a [`TextHeader`] whose counters track what was appended.
#[derive(Debug)]
pub(crate) struct CountedFile {
    path: PathBuf,
    out: BufWriter<File>,
    counter_offsets: Vec<u64>,
    counts: Vec<u64>,
    pending: u64,
    interval: u64,
}

impl CountedFile {
    /// Create the file and write its header. Counters are rewritten every
    /// `interval` records.
    pub fn create(path: PathBuf, header: &TextHeader, interval: u64) -> RecordResult<Self> {
        let file = create_fresh(&path)?;
        let rendered = header.render();
        let mut out = BufWriter::new(file);
        out.write_all(&rendered.bytes)
            .and_then(|_| out.flush())
            .map_err(|e| RecordError::fs(&path, e))?;
        Ok(Self {
            path,
            out,
            counts: vec![0; rendered.counter_offsets.len()],
            counter_offsets: rendered.counter_offsets,
            pending: 0,
            interval: interval.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn write_payload(&mut self, bytes: &[u8]) -> RecordResult<()> {
        self.out
            .write_all(bytes)
            .map_err(|e| RecordError::fs(&self.path, e))
    }

    /// Account for one finished record that advanced the counters by `deltas`.
    pub fn record_written(&mut self, deltas: &[u64]) -> RecordResult<()> {
        for (count, delta) in self.counts.iter_mut().zip(deltas) {
            *count += delta;
        }
        self.pending += 1;
        if self.pending >= self.interval {
            self.sync_counts()?;
        }
        Ok(())
    }

    /// Overwrite every counter with its current value.
    pub fn sync_counts(&mut self) -> RecordResult<()> {
        let path = &self.path;
        let out = &mut self.out;
        for (offset, count) in self.counter_offsets.iter().zip(&self.counts) {
            out.seek(SeekFrom::Start(*offset))
                .and_then(|_| out.write_all(format!("{count:0COUNTER_WIDTH$}").as_bytes()))
                .map_err(|e| RecordError::fs(path, e))?;
        }
        out.seek(SeekFrom::End(0))
            .and_then(|_| out.flush())
            .map_err(|e| RecordError::fs(path, e))?;
        self.pending = 0;
        Ok(())
    }

    /// Final counter rewrite, flush and sync. Returns the final counts.
    pub fn finish(mut self) -> RecordResult<Vec<u64>> {
        self.sync_counts()?;
        self.out
            .get_ref()
            .sync_all()
            .map_err(|e| RecordError::fs(&self.path, e))?;
        Ok(self.counts)
    }
}
