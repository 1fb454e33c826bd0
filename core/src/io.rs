//! Triple and category file I/O, grounded on `original_source/misc/
//! text2bin.cpp`'s three record widths and its text/binary input
//! branching. Modeled as a small enum with a uniform iterator rather than
//! the source's `_TEXT_`/`_BINARY_` preprocessor branching.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::triple::Triple;

/// How many whitespace-separated fields (text) or packed words (binary)
/// each record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// `col` only (used for category files and index-only dumps).
    One,
    /// `row col`.
    Two,
    /// `row col weight`.
    Three,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Text,
    Binary,
}

fn io_err(path: &Path, reason: impl std::fmt::Display) -> EngineError {
    EngineError::IoFailure { path: path.display().to_string(), reason: reason.to_string() }
}

/// Reads a triple file: 1-based indices on disk, converted to 0-based here
/// since every other component is 0-based.
pub fn read_triples(path: &Path, encoding: Encoding, mode: RecordMode) -> Result<Vec<Triple>> {
    match encoding {
        Encoding::Text => read_triples_text(path, mode),
        Encoding::Binary => read_triples_binary(path, mode),
    }
}

fn read_triples_text(path: &Path, mode: RecordMode) -> Result<Vec<Triple>> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parse_u32 = |f: Option<&str>| -> Result<u32> {
            f.ok_or_else(|| io_err(path, format!("line {}: missing field", lineno + 1)))?
                .parse::<u32>()
                .map_err(|e| io_err(path, format!("line {}: {e}", lineno + 1)))
        };
        match mode {
            RecordMode::One => {
                let c = parse_u32(fields.next())?;
                out.push(Triple::new(0, c.saturating_sub(1), 1.0));
            }
            RecordMode::Two => {
                let r = parse_u32(fields.next())?;
                let c = parse_u32(fields.next())?;
                out.push(Triple::new(r.saturating_sub(1), c.saturating_sub(1), 1.0));
            }
            RecordMode::Three => {
                let r = parse_u32(fields.next())?;
                let c = parse_u32(fields.next())?;
                let w: f64 = fields
                    .next()
                    .ok_or_else(|| io_err(path, format!("line {}: missing weight", lineno + 1)))?
                    .parse()
                    .map_err(|e| io_err(path, format!("line {}: {e}", lineno + 1)))?;
                out.push(Triple::new(r.saturating_sub(1), c.saturating_sub(1), w));
            }
        }
    }
    Ok(out)
}

fn read_triples_binary(path: &Path, mode: RecordMode) -> Result<Vec<Triple>> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| io_err(path, e))?;
    let record_len = match mode {
        RecordMode::One => 4,
        RecordMode::Two => 8,
        RecordMode::Three => 16,
    };
    if bytes.len() % record_len != 0 {
        return Err(io_err(
            path,
            format!("file length {} is not a multiple of the {record_len}-byte record size", bytes.len()),
        ));
    }
    let mut out = Vec::with_capacity(bytes.len() / record_len);
    for chunk in bytes.chunks_exact(record_len) {
        match mode {
            RecordMode::One => {
                let c = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
                out.push(Triple::new(0, c.saturating_sub(1), 1.0));
            }
            RecordMode::Two => {
                let r = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
                let c = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
                out.push(Triple::new(r.saturating_sub(1), c.saturating_sub(1), 1.0));
            }
            RecordMode::Three => {
                let r = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
                let c = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
                let w = f64::from_le_bytes(chunk[8..16].try_into().unwrap());
                out.push(Triple::new(r.saturating_sub(1), c.saturating_sub(1), w));
            }
        }
    }
    Ok(out)
}

/// Reads a ground-truth category vector: one `0`/`1` per row, text lines or
/// packed little-endian `u32`.
pub fn read_categories(path: &Path, encoding: Encoding) -> Result<Vec<bool>> {
    match encoding {
        Encoding::Text => {
            let file = File::open(path).map_err(|e| io_err(path, e))?;
            let reader = BufReader::new(file);
            let mut out = Vec::new();
            for line in reader.lines() {
                let line = line.map_err(|e| io_err(path, e))?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let v: u32 = line.parse().map_err(|e| io_err(path, e))?;
                out.push(v != 0);
            }
            Ok(out)
        }
        Encoding::Binary => {
            let mut file = File::open(path).map_err(|e| io_err(path, e))?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).map_err(|e| io_err(path, e))?;
            if bytes.len() % 4 != 0 {
                return Err(io_err(path, "category file length is not a multiple of 4"));
            }
            Ok(bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()) != 0)
                .collect())
        }
    }
}

/// Converts a text triple file to the packed binary format, preserving
/// 1-based on-disk indices untouched (grounded on
/// `original_source/misc/text2bin.cpp`). Returns the number of records
/// converted.
pub fn text_to_binary(input: &Path, output: &Path, mode: RecordMode) -> Result<u64> {
    let infile = File::open(input).map_err(|e| io_err(input, e))?;
    let reader = BufReader::new(infile);
    let mut outfile = File::create(output).map_err(|e| io_err(output, e))?;
    let mut count = 0u64;
    for line in reader.lines() {
        let line = line.map_err(|e| io_err(input, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        match mode {
            RecordMode::One => {
                let c: u32 = fields
                    .next()
                    .ok_or_else(|| io_err(input, "missing field"))?
                    .parse()
                    .map_err(|e| io_err(input, e))?;
                outfile.write_all(&c.to_le_bytes()).map_err(|e| io_err(output, e))?;
            }
            RecordMode::Two => {
                let r: u32 = fields.next().ok_or_else(|| io_err(input, "missing row"))?.parse().map_err(|e| io_err(input, e))?;
                let c: u32 = fields.next().ok_or_else(|| io_err(input, "missing col"))?.parse().map_err(|e| io_err(input, e))?;
                outfile.write_all(&r.to_le_bytes()).map_err(|e| io_err(output, e))?;
                outfile.write_all(&c.to_le_bytes()).map_err(|e| io_err(output, e))?;
            }
            RecordMode::Three => {
                let r: u32 = fields.next().ok_or_else(|| io_err(input, "missing row"))?.parse().map_err(|e| io_err(input, e))?;
                let c: u32 = fields.next().ok_or_else(|| io_err(input, "missing col"))?.parse().map_err(|e| io_err(input, e))?;
                let w: f64 = fields.next().ok_or_else(|| io_err(input, "missing weight"))?.parse().map_err(|e| io_err(input, e))?;
                outfile.write_all(&r.to_le_bytes()).map_err(|e| io_err(output, e))?;
                outfile.write_all(&c.to_le_bytes()).map_err(|e| io_err(output, e))?;
                outfile.write_all(&w.to_le_bytes()).map_err(|e| io_err(output, e))?;
            }
        }
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn reads_three_column_text_with_1_based_conversion() {
        let f = write_tmp("1 2 3.5\n2 1 -1.0\n");
        let triples = read_triples(f.path(), Encoding::Text, RecordMode::Three).unwrap();
        assert_eq!(triples, vec![Triple::new(0, 1, 3.5), Triple::new(1, 0, -1.0)]);
    }

    #[test]
    fn text_to_binary_round_trips_through_binary_reader() {
        let input = write_tmp("1 1 2.0\n2 2 4.0\n");
        let output = tempfile::NamedTempFile::new().unwrap();
        let n = text_to_binary(input.path(), output.path(), RecordMode::Three).unwrap();
        assert_eq!(n, 2);
        let triples = read_triples(output.path(), Encoding::Binary, RecordMode::Three).unwrap();
        assert_eq!(triples, vec![Triple::new(0, 0, 2.0), Triple::new(1, 1, 4.0)]);
    }

    #[test]
    fn reads_category_text_file() {
        let f = write_tmp("1\n0\n1\n");
        let cats = read_categories(f.path(), Encoding::Text).unwrap();
        assert_eq!(cats, vec![true, false, true]);
    }
}
