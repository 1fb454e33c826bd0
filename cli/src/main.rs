//! Command-line driver: parses the six positional arguments of the
//! benchmark contract, builds a [`Config`], runs the engine, and prints the
//! telemetry report line, exiting with the documented process code.

use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result};
use env_logger::Env;
use log::info;
use structopt::StructOpt;

use spdnn_core::config::{Config, InputType, Parallelism};
use spdnn_core::env::{InProcessComm, ThreadPool};
use spdnn_core::Comm;
use spdnn_core::io::{read_categories, read_triples, Encoding, RecordMode};
use spdnn_core::net::Net;
use spdnn_core::topology::NullTopology;

#[derive(Debug, StructOpt)]
#[structopt(name = "spdnn", about = "Sparse DNN inference benchmark engine")]
struct Options {
    /// Number of neurons per layer (1024, 4096, 16384, or 65536).
    n_neurons: u32,
    /// Number of layers (120, 480, or 1920).
    n_layers: u32,
    /// Directory holding the sparse-images-<Nneurons> feature file.
    input_prefix: String,
    /// Directory holding the per-layer weight files and category file.
    layer_prefix: String,
    /// Parallelism strategy: data_x_data or data_x_model.
    parallelism: String,
    /// Input encoding: text or binary.
    input_type: String,

    /// Number of simulated ranks.
    #[structopt(long, default_value = "1")]
    nranks: u32,
    /// Number of worker threads per rank.
    #[structopt(long, default_value = "1")]
    nthreads: u32,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match run() {
        Ok(challenge_pass) => {
            if challenge_pass {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(spdnn_core::error::EngineError::ChallengeFailed.exit_code() as u8)
            }
        }
        Err(err) => {
            log::error!("{err:#}");
            match err.downcast_ref::<spdnn_core::error::EngineError>() {
                Some(engine_err) => ExitCode::from(engine_err.exit_code() as u8),
                None => ExitCode::FAILURE,
            }
        }
    }
}

fn run() -> Result<bool> {
    let opts = Options::from_args();
    let parallelism = Parallelism::from_str(&opts.parallelism).context("invalid parallelism")?;
    let input_type = InputType::from_str(&opts.input_type).context("invalid input type")?;
    let config = Config::new(
        opts.n_neurons,
        opts.n_layers,
        opts.input_prefix,
        opts.layer_prefix,
        parallelism,
        input_type,
    )
    .context("invalid configuration")?;

    let encoding = match config.input_type {
        InputType::Text => Encoding::Text,
        InputType::Binary => Encoding::Binary,
    };

    info!(
        "loading {} neurons x {} layers ({:?}, {:?})",
        config.n_neurons, config.n_layers, config.parallelism, config.input_type
    );

    let feature_triples = read_triples(Path::new(&config.feature_file()), encoding, RecordMode::Three)
        .context("reading feature matrix")?;
    let n_input_instances = feature_triples.iter().map(|t| t.row + 1).max().unwrap_or(0);

    let mut layer_triples = Vec::with_capacity(config.n_layers as usize);
    for l in 0..config.n_layers {
        let triples = read_triples(Path::new(&config.layer_file(l)), encoding, RecordMode::Three)
            .with_context(|| format!("reading layer {l} weights"))?;
        layer_triples.push(triples);
    }
    let truth = read_categories(Path::new(&config.category_file()), encoding).context("reading ground truth")?;

    let comms = InProcessComm::new_group(opts.nranks);
    let pool = ThreadPool::new(opts.nthreads);
    let topology = NullTopology;

    let mut outcome = None;
    std::thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::with_capacity(comms.len());
        for comm in comms {
            let config = config.clone();
            // Every rank reads its own full copy of the layer weights (no
            // exchange ever crosses the wire for those), but only rank 0
            // holds the feature matrix read off disk here; every other
            // rank starts empty and receives its share through
            // `Tiling::build`'s all-to-all exchange, exactly like a real
            // MPI deployment where each rank reads a disjoint shard.
            let feature_triples = if comm.rank() == 0 { feature_triples.clone() } else { Vec::new() };
            let layer_triples = layer_triples.clone();
            let truth = truth.clone();
            let pool = &pool;
            let topology = &topology;
            handles.push(scope.spawn(move || -> Result<spdnn_core::net::RunOutcome> {
                let net = Net::new(config, &comm, pool, n_input_instances, feature_triples, layer_triples, truth)?;
                Ok(net.run(&comm, pool, topology)?)
            }));
        }
        for h in handles {
            outcome = Some(h.join().expect("worker rank panicked")?);
        }
        Ok(())
    })?;

    let outcome = outcome.expect("at least one rank must run");
    println!("{}", outcome.telemetry.report_line(outcome.challenge_pass));
    Ok(outcome.challenge_pass)
}
