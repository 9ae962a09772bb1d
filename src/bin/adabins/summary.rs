use serde::Serialize;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

pub const SCALARS_FILE: &str = "scalars.jsonl";

#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    step: usize,
    value: f64,
    wall_time: f64,
}

/// Appends scalar summaries as JSON lines to `<dir>/scalars.jsonl`.
#[derive(Debug)]
pub struct SummaryWriter {
    writer: BufWriter<File>,
}

impl SummaryWriter {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, SummaryError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.as_ref().join(SCALARS_FILE))?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<(), SummaryError> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        let record = ScalarRecord {
            tag,
            step,
            value,
            wall_time,
        };

        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SummaryError> {
        self.writer.flush()?;
        Ok(())
    }
}
