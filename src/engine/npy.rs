//! Minimal NPY v1.0 writer/reader for 2-D little-endian integer arrays.
//!
//! The header is always [`NPY_HEADER_LEN`] bytes, so the `shape` tuple can be
//! rewritten in place as rows are appended and the file stays loadable by
//! `numpy.load` at any point.

use crate::engine::header::create_fresh;
use crate::error::{RecordError, RecordResult};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Total header size, including magic, version and length prefix.
pub const NPY_HEADER_LEN: usize = 128;

/// Render a v1.0 header for a C-ordered `(rows, columns)` array.
pub fn render_header(descr: &str, rows: u64, columns: usize) -> RecordResult<[u8; NPY_HEADER_LEN]> {
    let dict = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': ({rows}, {columns}), }}");
    let body_len = NPY_HEADER_LEN - MAGIC.len() - 4;
    if dict.len() + 1 > body_len {
        return Err(RecordError::Configuration(format!(
            "npy header for dtype {descr} does not fit in {NPY_HEADER_LEN} bytes"
        )));
    }

    let mut header = [b' '; NPY_HEADER_LEN];
    header[..6].copy_from_slice(MAGIC);
    header[6] = 1;
    header[7] = 0;
    header[8..10].copy_from_slice(&(body_len as u16).to_le_bytes());
    header[10..10 + dict.len()].copy_from_slice(dict.as_bytes());
    header[NPY_HEADER_LEN - 1] = b'\n';
    Ok(header)
}

/// Fields of a parsed NPY header.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyHeader {
    /// dtype descriptor, e.g. `<i2`
    pub descr: String,
    /// Array shape
    pub shape: Vec<u64>,
    /// Offset of the first data byte
    pub data_offset: u64,
}

impl NpyHeader {
    /// Read the header of an `.npy` file.
    pub fn read(path: impl AsRef<Path>) -> RecordResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| RecordError::fs(path, e))?;
        let mut prefix = [0u8; 10];
        file.read_exact(&mut prefix)
            .map_err(|e| RecordError::fs(path, e))?;
        if &prefix[..6] != MAGIC {
            return Err(RecordError::Configuration(format!(
                "{} is not an npy file",
                path.display()
            )));
        }
        let len = usize::from(u16::from_le_bytes([prefix[8], prefix[9]]));
        let mut body = vec![0u8; len];
        file.read_exact(&mut body)
            .map_err(|e| RecordError::fs(path, e))?;
        let dict = String::from_utf8_lossy(&body);

        let descr = dict
            .split("'descr': '")
            .nth(1)
            .and_then(|rest| rest.split('\'').next())
            .map(str::to_string);
        let shape = dict
            .split("'shape': (")
            .nth(1)
            .and_then(|rest| rest.split(')').next())
            .map(|tuple| {
                tuple
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| s.parse().ok())
                    .collect::<Vec<u64>>()
            });

        match (descr, shape) {
            (Some(descr), Some(shape)) => Ok(Self {
                descr,
                shape,
                data_offset: (10 + len) as u64,
            }),
            _ => Err(RecordError::Configuration(format!(
                "{} has a malformed npy header",
                path.display()
            ))),
        }
    }
}

/// An `.npy` file that grows by whole rows.
#[derive(Debug)]
pub(crate) struct NpyFile {
    path: PathBuf,
    out: BufWriter<File>,
    descr: &'static str,
    columns: usize,
    rows: u64,
    pending: u64,
    interval: u64,
}

impl NpyFile {
    /// Create the file with an empty `(0, columns)` shape.
    pub fn create(path: PathBuf, descr: &'static str, columns: usize, interval: u64) -> RecordResult<Self> {
        let header = render_header(descr, 0, columns)?;
        let mut out = BufWriter::new(create_fresh(&path)?);
        out.write_all(&header)
            .and_then(|_| out.flush())
            .map_err(|e| RecordError::fs(&path, e))?;
        Ok(Self {
            path,
            out,
            descr,
            columns,
            rows: 0,
            pending: 0,
            interval: interval.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append `rows` complete rows of raw little-endian bytes.
    pub fn append_rows(&mut self, bytes: &[u8], rows: u64) -> RecordResult<()> {
        self.out
            .write_all(bytes)
            .map_err(|e| RecordError::fs(&self.path, e))?;
        self.rows += rows;
        self.pending += 1;
        if self.pending >= self.interval {
            self.sync_shape()?;
        }
        Ok(())
    }

    /// Rewrite the header with the current row count.
    pub fn sync_shape(&mut self) -> RecordResult<()> {
        let header = render_header(self.descr, self.rows, self.columns)?;
        let out = &mut self.out;
        out.seek(SeekFrom::Start(0))
            .and_then(|_| out.write_all(&header))
            .and_then(|_| out.seek(SeekFrom::End(0)))
            .and_then(|_| out.flush())
            .map_err(|e| RecordError::fs(&self.path, e))?;
        self.pending = 0;
        Ok(())
    }

    /// Final shape rewrite, flush and sync. Returns the row count.
    pub fn finish(mut self) -> RecordResult<u64> {
        self.sync_shape()?;
        self.out
            .get_ref()
            .sync_all()
            .map_err(|e| RecordError::fs(&self.path, e))?;
        Ok(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = render_header("<i2", 64000, 4).unwrap();
        assert_eq!(&header[..6], MAGIC);
        assert_eq!(u16::from_le_bytes([header[8], header[9]]), 118);
        assert_eq!(header[127], b'\n');
        let text = String::from_utf8_lossy(&header[10..]);
        assert!(text.starts_with("{'descr': '<i2', 'fortran_order': False, 'shape': (64000, 4), }"));
    }

    #[test]
    fn test_rows_update_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.din.npy");
        let mut file = NpyFile::create(path.clone(), "<i8", 2, 1).unwrap();
        assert_eq!(NpyHeader::read(&path).unwrap().shape, vec![0, 2]);

        let row: Vec<u8> = [500i64, 1].iter().flat_map(|v| v.to_le_bytes()).collect();
        file.append_rows(&row, 1).unwrap();
        file.append_rows(&row, 1).unwrap();
        assert_eq!(NpyHeader::read(&path).unwrap().shape, vec![2, 2]);
        assert_eq!(file.finish().unwrap(), 2);

        let header = NpyHeader::read(&path).unwrap();
        assert_eq!(header.descr, "<i8");
        assert_eq!(header.data_offset, 128);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 128 + 32);
    }
}
