//! Delimited metric output with a fixed column schema.
//!
//! Benchmark and trace collectors consume these files directly, so the writer enforces the
//! column contract at row boundaries instead of trusting call sites.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{GeodeError, GeodeResult};

/// Line-oriented writer that pins every row to the header's column count.
#[derive(Debug)]
pub struct CsvWriter {
    file: BufWriter<File>,
    num_columns: usize,
    line_items: usize,
    delimiter: char,
}

impl CsvWriter {
    /// Opens the output file and writes the header row.
    ///
    /// # Errors
    ///
    /// Returns `GeodeError::InvalidConfig` when no columns are given and `GeodeError::Io` when
    /// the file cannot be created or written.
    pub fn new<P: AsRef<Path>>(
        path: P,
        columns: &[&str],
        delimiter: char,
    ) -> GeodeResult<Self> {
        if columns.is_empty() {
            return Err(GeodeError::InvalidConfig(
                "csv writer requires at least one column",
            ));
        }
        let file = File::create(path)
            .map_err(|error| GeodeError::Io(format!("create csv file failed: {error}")))?;
        let mut writer = Self {
            file: BufWriter::new(file),
            num_columns: columns.len(),
            line_items: 0,
            delimiter,
        };
        let header = columns.join(",");
        writer
            .write_raw(&header)
            .and_then(|()| writer.write_raw("\n"))?;
        Ok(writer)
    }

    /// Appends one item to the current row.
    ///
    /// # Errors
    ///
    /// Returns `GeodeError::InvalidState` when the row already holds a full column set and
    /// `GeodeError::Io` on write failure.
    pub fn append<T: ToString>(&mut self, item: T) -> GeodeResult<&mut Self> {
        if self.line_items == self.num_columns {
            return Err(GeodeError::InvalidState(
                "csv row item count exceeds column count",
            ));
        }
        if self.line_items > 0 {
            let delimiter = self.delimiter;
            self.write_char(delimiter)?;
        }
        self.line_items += 1;
        self.write_raw(&item.to_string())?;
        Ok(self)
    }

    /// Terminates the current row.
    ///
    /// # Errors
    ///
    /// Returns `GeodeError::InvalidState` when the row holds fewer items than columns and
    /// `GeodeError::Io` on write failure.
    pub fn end_line(&mut self) -> GeodeResult<&mut Self> {
        if self.line_items != self.num_columns {
            return Err(GeodeError::InvalidState(
                "csv row item count must match column count",
            ));
        }
        self.write_raw("\n")?;
        self.line_items = 0;
        Ok(self)
    }

    /// Flushes buffered rows to the file.
    ///
    /// # Errors
    ///
    /// Returns `GeodeError::Io` on flush failure.
    pub fn flush(&mut self) -> GeodeResult<()> {
        self.file
            .flush()
            .map_err(|error| GeodeError::Io(format!("flush csv file failed: {error}")))
    }

    fn write_raw(&mut self, text: &str) -> GeodeResult<()> {
        self.file
            .write_all(text.as_bytes())
            .map_err(|error| GeodeError::Io(format!("write csv file failed: {error}")))
    }

    fn write_char(&mut self, ch: char) -> GeodeResult<()> {
        let mut buffer = [0_u8; 4];
        let encoded = ch.encode_utf8(&mut buffer);
        self.file
            .write_all(encoded.as_bytes())
            .map_err(|error| GeodeError::Io(format!("write csv file failed: {error}")))
    }
}
