//! Append-only text message log, flushed on every line.

use crate::engine::header::create_fresh;
use crate::error::{RecordError, RecordResult};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub(crate) struct MessageLog {
    path: PathBuf,
    out: BufWriter<File>,
    lines: u64,
}

impl MessageLog {
    /// Create the log, writing `preamble` lines first (each prefixed with `## `).
    pub fn create(path: PathBuf, preamble: &[String]) -> RecordResult<Self> {
        let mut out = BufWriter::new(create_fresh(&path)?);
        for line in preamble {
            writeln!(out, "## {line}").map_err(|e| RecordError::fs(&path, e))?;
        }
        out.flush().map_err(|e| RecordError::fs(&path, e))?;
        Ok(Self { path, out, lines: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `timestamp<TAB>message` and flush.
    pub fn append(&mut self, timestamp: i64, message: &str) -> RecordResult<()> {
        let message = message.replace(['\n', '\r'], " ");
        writeln!(self.out, "{timestamp}\t{message}")
            .and_then(|_| self.out.flush())
            .map_err(|e| RecordError::fs(&self.path, e))?;
        self.lines += 1;
        Ok(())
    }

    pub fn finish(mut self) -> RecordResult<u64> {
        self.out
            .flush()
            .and_then(|_| self.out.get_ref().sync_all())
            .map_err(|e| RecordError::fs(&self.path, e))?;
        Ok(self.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_on_disk_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.msg.txt");
        let mut log = MessageLog::create(path.clone(), &["sample rate 30000".to_string()]).unwrap();
        log.append(1200, "stimulus\non").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "## sample rate 30000\n1200\tstimulus on\n");
        assert_eq!(log.finish().unwrap(), 1);
    }
}
