use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use crate::config::Configuration;

const FILE_NAME: &str = "config.jsonl";

/// Receives text records for monitoring, write failures never reach the caller's control flow.
pub trait TelemetrySink: Send {
    fn add_text(&mut self, tag: &str, text: &str) -> io::Result<()>;
}

/// One configuration key and its string representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryRecord {
    pub tag: String,
    pub text: String,
}

/// Appends one JSON object per record to `config.jsonl` inside a directory.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Opens the sink, creating `dir` if needed.
    pub fn create<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let path = dir.as_ref().join(FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonLinesSink {
    fn add_text(&mut self, tag: &str, text: &str) -> io::Result<()> {
        #[derive(Serialize)]
        struct Line<'a> {
            tag: &'a str,
            text: &'a str,
        }

        serde_json::to_writer(&mut self.writer, &Line { tag, text })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Flattens the configuration into records sorted by key.
pub fn records(config: &Configuration) -> Vec<TelemetryRecord> {
    let fields = match serde_json::to_value(config) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => {
            warn!("configuration serialized to {other}, not an object");
            return Vec::new();
        }
        Err(e) => {
            warn!("configuration could not be serialized: {e}");
            return Vec::new();
        }
    };

    let mut records: Vec<_> = fields
        .into_iter()
        .map(|(tag, value)| TelemetryRecord {
            tag,
            text: match value {
                Value::String(text) => text,
                Value::Null => "None".to_string(),
                other => other.to_string(),
            },
        })
        .collect();

    records.sort_by(|a, b| a.tag.cmp(&b.tag));
    records
}

/// Writes every configuration key to `sink`, nothing happens without one.
pub fn report(config: &Configuration, sink: Option<&mut dyn TelemetrySink>) {
    let Some(sink) = sink else {
        return;
    };

    let records = records(config);
    for record in &records {
        if let Err(e) = sink.add_text(&record.tag, &record.text) {
            warn!(tag = record.tag.as_str(); "telemetry write failed, dropping the rest: {e}");
            return;
        }
    }

    debug!(records = records.len(); "configuration reported");
}
