//! Append-only CSV sinks
//!
//! One sink per monitor, one writer per sink. Rows are flushed one by one so
//! that every captured event is on disk before the next read begins.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use log::debug;

use super::events::CsvRow;
use crate::domain::MonitorError;

#[derive(Debug)]
pub struct RowSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl RowSink {
    /// Open `path` for appending rows of type `R`
    ///
    /// # Errors
    /// Returns [`MonitorError::Sink`] if the file cannot be opened or the header written
    pub fn open<R: CsvRow>(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        Self::open_with_header(path, R::header())
    }

    /// Open `path` in append mode, writing `header` only if the file is empty
    ///
    /// # Errors
    /// Returns [`MonitorError::Sink`] if the file cannot be opened or the header written
    pub fn open_with_header(path: impl AsRef<Path>, header: &[&str]) -> Result<Self, MonitorError> {
        let path = path.as_ref().to_path_buf();
        let sink_err = |source: csv::Error| MonitorError::Sink { path: path.clone(), source };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| sink_err(e.into()))?;
        let empty = file.metadata().map_err(|e| sink_err(e.into()))?.len() == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if empty {
            writer.write_record(header).map_err(sink_err)?;
            writer.flush().map_err(|e| sink_err(e.into()))?;
            debug!("Wrote header to {}", path.display());
        }

        Ok(Self { path, writer })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and flush it
    ///
    /// # Errors
    /// Returns [`MonitorError::Sink`] on a write or flush failure
    pub fn append<R: CsvRow>(&mut self, row: &R) -> Result<(), MonitorError> {
        self.append_record(&row.record())
    }

    /// Append raw fields and flush them
    ///
    /// # Errors
    /// Returns [`MonitorError::Sink`] on a write or flush failure
    pub fn append_record(&mut self, fields: &[String]) -> Result<(), MonitorError> {
        self.writer
            .write_record(fields)
            .map_err(|source| MonitorError::Sink { path: self.path.clone(), source })?;
        self.writer
            .flush()
            .map_err(|e| MonitorError::Sink { path: self.path.clone(), source: e.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::events::FunctionEvent;
    use crate::domain::Pid;
    use std::fs;

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("function.csv");

        let mut sink = RowSink::open::<FunctionEvent>(&path).unwrap();
        sink.append(&FunctionEvent { pid: Pid(1), duration_ns: 10 }).unwrap();
        drop(sink);

        let mut sink = RowSink::open::<FunctionEvent>(&path).unwrap();
        sink.append(&FunctionEvent { pid: Pid(2), duration_ns: 20 }).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "pid,duration\n1,10\n2,20\n");
    }

    #[test]
    fn test_rows_visible_before_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("function.csv");

        let mut sink = RowSink::open::<FunctionEvent>(&path).unwrap();
        sink.append(&FunctionEvent { pid: Pid(3), duration_ns: 30 }).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "pid,duration\n3,30\n");
    }

    #[test]
    fn test_open_in_missing_directory() {
        let err = RowSink::open::<FunctionEvent>("/nonexistent/dir/out.csv").unwrap_err();
        assert!(matches!(err, MonitorError::Sink { .. }));
    }
}
