//! NDJSON encodings for the shuffle stream and the summary stream. Keys are
//! always written as a `{location, disaster_type}` object.

use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::diagnostics::{Diagnostic, DiagnosticSink, RecordError, Stage};
use crate::models::{ClassifiedRecord, GroupKey, SummaryRecord};
use crate::source::decoded_lines;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryLine {
    pub run_id: Uuid,
    pub key: GroupKey,
    pub summary: SummaryRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleLine {
    pub key: GroupKey,
    pub record: Value,
}

pub fn open_output(path: Option<&Path>) -> anyhow::Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create output {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(BufWriter::new(io::stdout()))),
    }
}

pub fn write_summaries<W: Write>(
    writer: &mut W,
    run_id: Uuid,
    summaries: &[(GroupKey, SummaryRecord)],
) -> anyhow::Result<()> {
    for (key, summary) in summaries {
        let line = SummaryLine {
            run_id,
            key: key.clone(),
            summary: summary.clone(),
        };
        serde_json::to_writer(&mut *writer, &line)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_summaries<R: BufRead>(reader: R) -> anyhow::Result<Vec<SummaryLine>> {
    let mut lines = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: SummaryLine = serde_json::from_str(&line)
            .with_context(|| format!("invalid summary on line {}", index + 1))?;
        lines.push(parsed);
    }
    Ok(lines)
}

pub fn write_shuffle<W: Write>(
    writer: &mut W,
    pairs: &[(GroupKey, ClassifiedRecord)],
) -> anyhow::Result<()> {
    for (key, record) in pairs {
        let line = ShuffleLine {
            key: key.clone(),
            record: record.payload.clone(),
        };
        serde_json::to_writer(&mut *writer, &line)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Lines without a usable key, or that are not UTF-8, cannot be routed to any
/// group; they are reported and skipped. The record body is passed through
/// undecoded.
pub fn read_shuffle<R: BufRead>(
    reader: R,
    sink: &dyn DiagnosticSink,
) -> anyhow::Result<Vec<(GroupKey, ClassifiedRecord)>> {
    let mut pairs = Vec::new();
    for line in decoded_lines(reader) {
        let (position, decoded) = line?;
        let text = match decoded {
            Ok(text) => text,
            Err(err) => {
                sink.report(Diagnostic::new(
                    Stage::Aggregate,
                    position,
                    RecordError::malformed(format!("shuffle line is not valid UTF-8: {err}")),
                ));
                continue;
            }
        };
        match serde_json::from_str::<ShuffleLine>(&text) {
            Ok(parsed) => pairs.push((parsed.key, ClassifiedRecord::relevant(parsed.record))),
            Err(err) => sink.report(Diagnostic::new(
                Stage::Aggregate,
                position,
                RecordError::malformed(format!("unroutable shuffle line: {err}")),
            )),
        }
    }
    Ok(pairs)
}
