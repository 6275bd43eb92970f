// SPDX-License-Identifier: Apache-2.0

//! Builtin sink backends: enough to run, debug and test the pipeline
//! without any external service.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::info;

use crate::error::{Error, Result};

use super::{Delivery, Envelope, Sink};

pub(super) fn echo_sink(name: &str, _options: &toml::Table) -> Result<Box<dyn Sink>> {
    Ok(Box::new(EchoSink {
        name: name.to_string(),
    }))
}

pub(super) fn file_sink(name: &str, options: &toml::Table) -> Result<Box<dyn Sink>> {
    let path = options
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Config(format!("sink \"{name}\": file sink requires \"path\"")))?;
    Ok(Box::new(FileSink::create(name, PathBuf::from(path))?))
}

pub(super) fn null_sink(name: &str, _options: &toml::Table) -> Result<Box<dyn Sink>> {
    Ok(Box::new(NullSink {
        name: name.to_string(),
    }))
}

pub(super) fn tally_sink(name: &str, _options: &toml::Table) -> Result<Box<dyn Sink>> {
    Ok(Box::new(TallySink {
        name: name.to_string(),
        records: 0,
        bytes: 0,
    }))
}

/// Prints each record as one JSON line on stdout.
pub struct EchoSink {
    name: String,
}

impl Sink for EchoSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, batch: &[Envelope]) -> Delivery {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for envelope in batch {
            let json = serde_json::Value::Object(
                envelope
                    .record
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            );
            if writeln!(out, "{json}").is_err() {
                return Delivery::failed_permanent("stdout closed");
            }
        }
        Delivery::Delivered
    }
}

/// Appends each block's provenance and raw text to a target file.
pub struct FileSink {
    name: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(name: &str, path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            name: name.to_string(),
            path,
            writer: BufWriter::new(file),
        })
    }

    fn write_batch(&mut self, batch: &[Envelope]) -> std::io::Result<()> {
        for envelope in batch {
            writeln!(
                self.writer,
                "{} [{}..{}]",
                envelope.block.path, envelope.block.begin, envelope.block.end
            )?;
            self.writer.write_all(&envelope.block.raw)?;
            if !envelope.block.raw.ends_with(b"\n") {
                self.writer.write_all(b"\n")?;
            }
        }
        self.writer.flush()
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, batch: &[Envelope]) -> Delivery {
        match self.write_batch(batch) {
            Ok(()) => Delivery::Delivered,
            // Disk errors may clear (rotation, space); let the channel back off.
            Err(e) => Delivery::failed_retryable(format!("{}: {e}", self.path.display())),
        }
    }
}

/// Discards everything. Useful for draining a channel without side effects.
pub struct NullSink {
    name: String,
}

impl Sink for NullSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, _batch: &[Envelope]) -> Delivery {
        Delivery::Delivered
    }
}

/// Counts records and bytes, reporting totals when flushed.
pub struct TallySink {
    name: String,
    records: u64,
    bytes: u64,
}

impl TallySink {
    pub fn totals(&self) -> (u64, u64) {
        (self.records, self.bytes)
    }
}

impl Sink for TallySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, batch: &[Envelope]) -> Delivery {
        self.records += batch.len() as u64;
        self.bytes += batch.iter().map(|e| e.block.len()).sum::<u64>();
        Delivery::Delivered
    }

    fn flush(&mut self) {
        info!(
            sink = %self.name,
            records = self.records,
            bytes = self.bytes,
            "tally"
        );
        self.records = 0;
        self.bytes = 0;
    }
}
