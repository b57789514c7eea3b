//! Input decoding. Each format is turned into a sequence of independently
//! decodable records; nothing here judges relevance.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::string::FromUtf8Error;

use anyhow::Context;
use clap::ValueEnum;
use serde_json::{Map, Number, Value};

use crate::classifier::RawInput;
use crate::diagnostics::{Diagnostic, DiagnosticSink, RecordError, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputFormat {
    Ndjson,
    JsonArray,
    Csv,
}

impl InputFormat {
    pub fn infer(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => InputFormat::Csv,
            Some(ext) if ext.eq_ignore_ascii_case("json") => InputFormat::JsonArray,
            _ => InputFormat::Ndjson,
        }
    }
}

/// One input record with the 1-based line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRecord {
    pub position: usize,
    pub input: RawInput,
}

pub fn load(
    path: &Path,
    format: Option<InputFormat>,
    sink: &dyn DiagnosticSink,
) -> anyhow::Result<Vec<InputRecord>> {
    let format = format.unwrap_or_else(|| InputFormat::infer(path));
    let file =
        File::open(path).with_context(|| format!("failed to open input {}", path.display()))?;
    let reader = BufReader::new(file);

    let records = match format {
        InputFormat::Ndjson => read_ndjson(reader, sink),
        InputFormat::JsonArray => read_json_array(reader),
        InputFormat::Csv => read_csv(reader, sink),
    }
    .with_context(|| format!("failed to read {:?} input {}", format, path.display()))?;

    Ok(records)
}

/// Splits `reader` on `\n`, yielding 1-based line numbers and each line
/// decoded as UTF-8. Blank lines are skipped; only I/O failures are `Err`.
pub(crate) fn decoded_lines<R: BufRead>(
    reader: R,
) -> impl Iterator<Item = io::Result<(usize, Result<String, FromUtf8Error>)>> {
    reader
        .split(b'\n')
        .enumerate()
        .filter_map(|(index, chunk)| {
            let mut bytes = match chunk {
                Ok(bytes) => bytes,
                Err(err) => return Some(Err(err)),
            };
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            let decoded = String::from_utf8(bytes);
            if matches!(&decoded, Ok(line) if line.trim().is_empty()) {
                return None;
            }
            Some(Ok((index + 1, decoded)))
        })
}

/// Lines are not decoded as JSON here, so a broken line surfaces later as a
/// rejected record. Lines that are not UTF-8 are reported and skipped.
pub fn read_ndjson<R: BufRead>(
    reader: R,
    sink: &dyn DiagnosticSink,
) -> anyhow::Result<Vec<InputRecord>> {
    let mut records = Vec::new();
    for line in decoded_lines(reader) {
        let (position, decoded) = line?;
        match decoded {
            Ok(text) => records.push(InputRecord {
                position,
                input: RawInput::Text(text),
            }),
            Err(err) => sink.report(Diagnostic::new(
                Stage::Source,
                position,
                RecordError::malformed(format!("line is not valid UTF-8: {err}")),
            )),
        }
    }
    Ok(records)
}

pub fn read_json_array<R: Read>(reader: R) -> anyhow::Result<Vec<InputRecord>> {
    let values: Vec<Value> =
        serde_json::from_reader(reader).context("input is not a JSON array")?;
    Ok(values
        .into_iter()
        .enumerate()
        .map(|(index, value)| InputRecord {
            position: index + 1,
            input: RawInput::Value(value),
        })
        .collect())
}

/// Typed columns are converted; a row that cannot be read or converted is
/// dropped and reported. Empty cells are left out of the record.
pub fn read_csv<R: Read>(
    reader: R,
    sink: &dyn DiagnosticSink,
) -> anyhow::Result<Vec<InputRecord>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = reader.headers()?.clone();
    let mut records = Vec::new();

    for (index, row) in reader.records().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                let position = err
                    .position()
                    .map(|pos| pos.line() as usize)
                    .unwrap_or(index + 2);
                sink.report(Diagnostic::new(
                    Stage::Source,
                    position,
                    RecordError::malformed(format!("unreadable CSV row: {err}")),
                ));
                continue;
            }
        };
        let position = row
            .position()
            .map(|pos| pos.line() as usize)
            .unwrap_or(index + 2);

        let mut object = Map::new();
        let mut failure = None;
        for (header, cell) in headers.iter().zip(row.iter()) {
            match convert_cell(header, cell) {
                Ok(Some(value)) => {
                    object.insert(header.to_string(), value);
                }
                Ok(None) => {}
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        match failure {
            Some(err) => sink.report(Diagnostic::new(Stage::Source, position, err)),
            None => records.push(InputRecord {
                position,
                input: RawInput::Value(Value::Object(object)),
            }),
        }
    }

    Ok(records)
}

fn convert_cell(header: &str, cell: &str) -> Result<Option<Value>, RecordError> {
    let cell = cell.trim();
    let numeric = matches!(header, "severity" | "retweet_count" | "lat" | "lng");
    if cell.is_empty() && (numeric || header == "verified_report") {
        return Ok(None);
    }

    let bad_cell =
        |kind: &str| RecordError::malformed(format!("column `{header}`: {cell:?} is not {kind}"));

    let value = match header {
        "severity" | "retweet_count" => {
            let parsed: i64 = cell.parse().map_err(|_| bad_cell("an integer"))?;
            Value::Number(parsed.into())
        }
        "verified_report" => Value::Bool(cell == "1" || cell.eq_ignore_ascii_case("true")),
        "lat" | "lng" => {
            let parsed: f64 = cell.parse().map_err(|_| bad_cell("a number"))?;
            Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| bad_cell("a finite number"))?
        }
        _ => Value::String(cell.to_string()),
    };
    Ok(Some(value))
}
