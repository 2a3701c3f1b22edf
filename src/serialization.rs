//! NDJSON ingress and egress.
//!
//! Records come in one JSON object per line; outcomes go out the same way.

use std::io::{BufRead, Write};

use serde::Serialize;
use thiserror::Error;

use crate::record::AuditRecord;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: invalid record: {source}")]
    Record {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// NDJSON (Newline Delimited JSON) writer
pub struct NdjsonWriter<W: Write> {
    writer: W,
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a single value as an NDJSON line
    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), SerializationError> {
        let json = serde_json::to_string(value)?;
        writeln!(self.writer, "{}", json)?;
        Ok(())
    }

    pub fn write_all<T: Serialize>(&mut self, values: &[T]) -> Result<(), SerializationError> {
        for value in values {
            self.write(value)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SerializationError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads [`AuditRecord`]s from NDJSON input, skipping blank lines.
///
/// A malformed line yields an error naming its line number.
pub struct RecordReader<R: BufRead> {
    lines: std::io::Lines<R>,
    line: usize,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<AuditRecord, SerializationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;

            if text.trim().is_empty() {
                continue;
            }

            let line = self.line;
            return Some(
                serde_json::from_str(&text)
                    .map_err(|source| SerializationError::Record { line, source }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[derive(Serialize)]
    struct Row {
        name: String,
        value: i32,
    }

    #[test]
    fn test_ndjson_writer() {
        let mut buf = Vec::new();
        let mut writer = NdjsonWriter::new(&mut buf);

        writer
            .write_all(&[
                Row {
                    name: "Alice".to_string(),
                    value: 42,
                },
                Row {
                    name: "Bob".to_string(),
                    value: 24,
                },
            ])
            .unwrap();
        writer.flush().unwrap();

        let output = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"name":"Alice","value":42}"#);
        assert!(lines[1].contains("Bob"));
    }

    #[test]
    fn test_record_reader() {
        let input = concat!(
            r#"{"id":1,"user":"alice","time":"2024-03-01T12:00:00Z","values":{"dept":"sales"}}"#,
            "\n\n",
            r#"{"id":2,"user":"bob","time":"2024-03-01T12:05:00.250Z"}"#,
            "\n",
        );

        let records: Vec<AuditRecord> = RecordReader::new(Cursor::new(input))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("dept"), Some(json!("sales")));
        assert_eq!(records[1].user(), "bob");
        assert!(records[1].values().is_empty());
    }

    #[test]
    fn test_record_reader_reports_line() {
        let input = "\n{\"id\":1,\"user\":\"a\",\"time\":\"2024-03-01T12:00:00Z\"}\n{\"id\":\"x\"}\n";
        let mut reader = RecordReader::new(Cursor::new(input));

        assert!(reader.next().unwrap().is_ok());
        match reader.next().unwrap() {
            Err(SerializationError::Record { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected record error, got {:?}", other.map(|r| r.id())),
        }
        assert!(reader.next().is_none());
    }
}
