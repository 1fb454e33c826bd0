//! Converts a whitespace-separated triple file to the packed little-endian
//! binary format, reporting the inferred shape the way
//! `original_source/misc/text2bin.cpp` does.

use std::path::PathBuf;

use anyhow::{Context, Result};
use structopt::StructOpt;

use spdnn_core::io::{read_triples, text_to_binary, Encoding, RecordMode};

#[derive(Debug, StructOpt)]
#[structopt(name = "text2bin", about = "Convert a text triple file to packed binary")]
struct Options {
    input: PathBuf,
    output: PathBuf,
    /// Record width: one, two, or three (row, col, weight).
    #[structopt(default_value = "three")]
    mode: String,
}

fn parse_mode(s: &str) -> Result<RecordMode> {
    match s {
        "one" | "1" => Ok(RecordMode::One),
        "two" | "2" => Ok(RecordMode::Two),
        "three" | "3" => Ok(RecordMode::Three),
        other => anyhow::bail!("unknown record mode '{other}', expected one, two, or three"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Options::from_args();
    let mode = parse_mode(&opts.mode)?;

    let count = text_to_binary(&opts.input, &opts.output, mode).context("converting text triples to binary")?;
    let triples = read_triples(&opts.output, Encoding::Binary, mode).context("reading back converted triples")?;
    let nrows = triples.iter().map(|t| t.row + 1).max().unwrap_or(0);
    let ncols = triples.iter().map(|t| t.col + 1).max().unwrap_or(0);

    println!("[{nrows} x {ncols}], nnz={count}");
    Ok(())
}
