//! The execution loop, grounded on `original_source/src/
//! net.hpp`'s `Net::execute`/`Net::inferenceReLU_t`: sets up the feature,
//! output, and layer matrices, then drives the `L`-layer SpGEMM iteration
//! under one of the two parallelism strategies, validating against ground
//! truth and collecting [`Telemetry`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, info, warn};

use crate::config::{Config, Parallelism};
use crate::csc::{Csc, SharedCsc, StripeReport};
use crate::env::{Comm, ThreadPool};
use crate::error::{EngineError, Result};
use crate::spa::Spa;
use crate::spgemm::{spmm_numeric, spmm_symb};
use crate::tiling::{Tiling, TilingKind, TilingParams, TripleSource};
use crate::timing::Telemetry;
use crate::topology::Topology;
use crate::triple::Triple;

/// One (row, col) stripe split evenly across `n` workers.
fn even_stripe(total: u32, n: u32, index: u32) -> (u32, u32) {
    let base = total / n;
    let rem = total % n;
    let start = index * base + index.min(rem);
    let end = start + base + if index < rem { 1 } else { 0 };
    (start, end)
}

/// A ping-ponged pair of matrices a thread or rank alternates between as
/// `A`/`C` across odd/even layers, avoiding a literal copy when repopulating
/// the input for the next layer.
struct BufferPair {
    buf0: SharedCsc,
    buf1: SharedCsc,
}

impl BufferPair {
    fn roles(&self, layer: u32) -> (&SharedCsc, &SharedCsc) {
        if layer % 2 == 0 {
            (&self.buf0, &self.buf1)
        } else {
            (&self.buf1, &self.buf0)
        }
    }
}

pub struct Net {
    config: Config,
    bias: f64,
    strategy: Parallelism,
    feature_tiling: Tiling,
    layers: Vec<Csc>,
    buffers: Vec<BufferPair>,
    truth: Vec<bool>,
}

pub struct RunOutcome {
    pub telemetry: Telemetry,
    pub challenge_pass: bool,
    /// This rank's derived categories, in ascending row order. Covers only
    /// the rows this rank owns, not the whole input matrix.
    pub categories: Vec<bool>,
}

struct ThreadReport {
    telemetry: Telemetry,
    local_pass: bool,
    row_start: u32,
    categories: Vec<bool>,
}

impl Net {
    /// Builds the feature/output tilings and loads every layer's weight
    /// matrix. `feature_triples` is this rank's share of the (already
    /// row-major partitioned, 1-based-free) input matrix; `layer_triples`
    /// holds one full weight-matrix triple list per layer, identical on
    /// every rank (weights are read, not distributed).
    pub fn new(
        config: Config,
        comm: &dyn Comm,
        pool: &ThreadPool,
        n_input_instances: u32,
        feature_triples: Vec<Triple>,
        layer_triples: Vec<Vec<Triple>>,
        truth: Vec<bool>,
    ) -> Result<Net> {
        if layer_triples.len() as u32 != config.n_layers {
            return Err(EngineError::ConfigInvalid(format!(
                "expected {} layer weight files, got {}",
                config.n_layers,
                layer_triples.len()
            )));
        }
        let bias = config.bias_value()?;
        let nranks = comm.size();
        let nthreads = pool.nthreads();

        // Row1D throughout: data x model keeps one contiguous row tile per
        // rank (columns of the layer matrix are split across threads
        // instead), data x data hands every thread its own row tile.
        let (nrowgrps, tiling_nthreads) = match config.parallelism {
            Parallelism::DataXModel => (nranks, 1),
            Parallelism::DataXData => (nranks * nthreads, nthreads),
        };
        let feature_params = TilingParams {
            ntiles: nrowgrps,
            nrowgrps,
            ncolgrps: 1,
            nranks,
            nthreads: tiling_nthreads,
            nnz: feature_triples.len() as u64,
            nrows: n_input_instances,
            ncols: config.n_neurons,
            kind: TilingKind::Row1D,
            input_source: TripleSource::None,
            repartition: true,
        };
        let mut feature_tiling = Tiling::build(feature_params.clone(), feature_triples, comm)?;
        let output_params = TilingParams { repartition: false, ..feature_params };
        let mut output_tiling = Tiling::build(output_params, Vec::new(), comm)?;

        let mut layers = Vec::with_capacity(layer_triples.len());
        for mut triples in layer_triples {
            crate::triple::sort_col_major(&mut triples);
            let csc = Csc::populate_from_triples(&triples, config.n_neurons, config.n_neurons, 0)?;
            layers.push(csc);
        }

        let buffer_count = match config.parallelism {
            Parallelism::DataXModel => 1,
            Parallelism::DataXData => nthreads,
        };
        let my_rank = comm.rank();
        let mut buffers = Vec::with_capacity(buffer_count as usize);
        for slot in 0..buffer_count {
            let owner_thread = match config.parallelism {
                Parallelism::DataXModel => 0,
                Parallelism::DataXData => slot,
            };
            let (fi, fj) = feature_tiling.find_owned(my_rank, owner_thread).ok_or_else(|| {
                EngineError::TilingFailure(format!(
                    "no feature tile owned by rank {my_rank} thread {owner_thread}"
                ))
            })?;
            let (oi, oj) = output_tiling.find_owned(my_rank, owner_thread).ok_or_else(|| {
                EngineError::TilingFailure(format!(
                    "no output tile owned by rank {my_rank} thread {owner_thread}"
                ))
            })?;
            let a = feature_tiling.take_csc(fi, fj)?;
            let c = output_tiling.take_csc(oi, oj)?;
            buffers.push(BufferPair { buf0: SharedCsc::new(a), buf1: SharedCsc::new(c) });
        }

        Ok(Net { strategy: config.parallelism, config, bias, feature_tiling, layers, buffers, truth })
    }

    fn buffer_index(&self, tid: u32) -> usize {
        match self.strategy {
            Parallelism::DataXModel => 0,
            Parallelism::DataXData => tid as usize,
        }
    }

    fn row_extent_for(&self, tid: u32, comm_rank: u32) -> (u32, u32) {
        let owner_thread = match self.strategy {
            Parallelism::DataXModel => 0,
            Parallelism::DataXData => tid,
        };
        let (i, _j) = self
            .feature_tiling
            .find_owned(comm_rank, owner_thread)
            .expect("row extent requested for an unowned tile");
        let tile = self.feature_tiling.tile(i, 0);
        (tile.start_row, tile.end_row)
    }

    /// Runs the full `L`-layer iteration and validates against ground
    /// truth. `topology` pins each worker's SPA to its reported socket.
    pub fn run(&self, comm: &dyn Comm, pool: &ThreadPool, topology: &dyn Topology) -> Result<RunOutcome> {
        let nthreads = pool.nthreads();
        let n_layers = self.config.n_layers;
        let offsets: Vec<AtomicU64> = (0..nthreads).map(|_| AtomicU64::new(0)).collect();
        let finals: Vec<AtomicU64> = (0..nthreads).map(|_| AtomicU64::new(0)).collect();
        let my_rank = comm.rank();

        info!("rank {my_rank}: running {n_layers} layers across {nthreads} threads ({:?})", self.strategy);

        let reports: Vec<Result<ThreadReport>> = pool.scope_run(|tid| {
            self.run_worker(tid, pool, topology, &offsets, &finals, my_rank, n_layers)
        });

        let mut telemetry = Telemetry::new();
        let mut local_pass = true;
        let mut by_row_start: Vec<(u32, Vec<bool>)> = Vec::new();
        for r in reports {
            let report = r?;
            telemetry.exec.extend(&report.telemetry.exec);
            telemetry.spmm_symb.extend(&report.telemetry.spmm_symb);
            telemetry.spmm_numeric.extend(&report.telemetry.spmm_numeric);
            telemetry.realloc.extend(&report.telemetry.realloc);
            local_pass &= report.local_pass;
            if !report.categories.is_empty() {
                by_row_start.push((report.row_start, report.categories));
            }
        }
        if !local_pass {
            warn!("rank {my_rank}: categories disagree with ground truth on at least one owned tile");
        }
        by_row_start.sort_by_key(|(row_start, _)| *row_start);
        let mut categories = Vec::new();
        for (_, cats) in by_row_start {
            categories.extend(cats);
        }

        let challenge_pass = comm.all_reduce_and(0xC4A1_1E6E, local_pass)?;
        Ok(RunOutcome { telemetry, challenge_pass, categories })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_worker(
        &self,
        tid: u32,
        pool: &ThreadPool,
        topology: &dyn Topology,
        offsets: &[AtomicU64],
        finals: &[AtomicU64],
        my_rank: u32,
        n_layers: u32,
    ) -> Result<ThreadReport> {
        let buf_idx = self.buffer_index(tid);
        let pair = &self.buffers[buf_idx];
        let (row_start, row_end) = self.row_extent_for(tid, my_rank);
        let mut spa = Spa::new((row_end - row_start).max(1) as usize, topology.socket_of(tid))?;
        let mut telemetry = Telemetry::new();

        for l in 0..n_layers {
            let exec_start = Instant::now();
            let (a, c) = pair.roles(l);
            let b = &self.layers[l as usize];

            let (start_col, end_col, off_col) = match self.strategy {
                Parallelism::DataXData => (0, b.ncols(), 0),
                Parallelism::DataXModel => {
                    let (s, e) = even_stripe(b.ncols(), pool.nthreads(), tid);
                    (s, e, 0)
                }
            };

            let symb_start = Instant::now();
            let nnz_local = spmm_symb(a.get(), b, &mut spa, start_col, end_col)?;
            telemetry.spmm_symb.push_secs(symb_start.elapsed());
            debug!("tid {tid} layer {l}: symbolic pass estimates {nnz_local} local nonzeros");

            let realloc_start = Instant::now();
            let mut idx_nnz;
            match self.strategy {
                Parallelism::DataXData => {
                    unsafe {
                        c.get_mut_exclusive().reallocate(nnz_local, a.get().nrows(), b.ncols(), None)?;
                    }
                    idx_nnz = 0u64;
                }
                Parallelism::DataXModel => {
                    offsets[tid as usize].store(nnz_local, Ordering::Relaxed);
                    pool.barrier().wait();
                    if tid == 0 {
                        let mut running = 0u64;
                        let mut prefix = vec![0u64; pool.nthreads() as usize];
                        for t in 0..pool.nthreads() {
                            prefix[t as usize] = running;
                            running += offsets[t as usize].load(Ordering::Relaxed);
                        }
                        for t in 0..pool.nthreads() {
                            finals[t as usize].store(prefix[t as usize], Ordering::Relaxed);
                        }
                        unsafe {
                            c.get_mut_exclusive().reallocate(running, a.get().nrows(), b.ncols(), None)?;
                        }
                    }
                    pool.barrier().wait();
                    idx_nnz = finals[tid as usize].load(Ordering::Relaxed);
                }
            }
            telemetry.realloc.push_secs(realloc_start.elapsed());

            let numeric_start = Instant::now();
            let stripe_old_offset = idx_nnz;
            spmm_numeric(a.get(), b, c.get(), &mut spa, self.bias, start_col, end_col, off_col, &mut idx_nnz)?;
            telemetry.spmm_numeric.push_secs(numeric_start.elapsed());

            match self.strategy {
                Parallelism::DataXData => {
                    unsafe {
                        c.get_mut_exclusive().finalize_tail(idx_nnz);
                    }
                }
                Parallelism::DataXModel => {
                    finals[tid as usize].store(idx_nnz - stripe_old_offset, Ordering::Relaxed);
                    pool.barrier().wait();
                    if tid == 0 {
                        let mut reports = Vec::with_capacity(pool.nthreads() as usize);
                        let mut running_offset = 0u64;
                        for t in 0..pool.nthreads() {
                            let (s, e) = even_stripe(b.ncols(), pool.nthreads(), t);
                            let actual = finals[t as usize].load(Ordering::Relaxed);
                            reports.push(StripeReport {
                                start_col: s,
                                end_col: e,
                                old_offset: running_offset,
                                actual_count: actual,
                            });
                            running_offset += offsets[t as usize].load(Ordering::Relaxed);
                        }
                        unsafe {
                            c.get_mut_exclusive().adjust_stripes(&reports)?;
                        }
                    }
                    pool.barrier().wait();
                }
            }

            telemetry.exec.push_secs(exec_start.elapsed());
            pool.barrier().wait();
        }

        spa.assert_zeroed();
        let (final_a, _) = pair.roles(n_layers);

        // Every thread in data x model shares the single rank-level output
        // buffer and the same row extent, so only one of them needs to
        // derive and report categories; the rest would just duplicate it.
        let reports_categories = !matches!(self.strategy, Parallelism::DataXModel) || tid == 0;
        let categories = if reports_categories { derive_categories(final_a.get()) } else { Vec::new() };
        let truth_slice = &self.truth[row_start as usize..row_end as usize];
        let local_pass = !reports_categories || categories == truth_slice;
        Ok(ThreadReport { telemetry, local_pass, row_start, categories })
    }
}

/// `category[i] = 1` iff row `i` has any nonzero entry.
fn derive_categories(csc: &Csc) -> Vec<bool> {
    let mut hit = vec![false; csc.nrows() as usize];
    for &row in csc.ia() {
        hit[row as usize] = true;
    }
    hit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputType;
    use crate::env::InProcessComm;
    use crate::topology::NullTopology;

    fn triple(row: u32, col: u32, w: f64) -> Triple {
        Triple::new(row, col, w)
    }

    /// A single identity layer should leave every nonzero input row marked
    /// as a surviving category.
    #[test]
    fn single_rank_single_thread_identity_layer_round_trips() {
        let comm = InProcessComm::new_group(1).remove(0);
        let pool = ThreadPool::new(1);
        let topology = NullTopology;

        let config = Config::new(1024, 120, "in", "layers", Parallelism::DataXData, InputType::Text).unwrap();
        let feature_triples = vec![triple(0, 0, 1.0), triple(1, 1, 1.0)];
        // Weight 2.0 on the diagonal overcomes the -0.3 per-layer bias so
        // both rows saturate at the ReLU cap instead of decaying to zero.
        let identity: Vec<Triple> = (0..1024u32).map(|i| triple(i, i, 2.0)).collect();
        let layer_triples: Vec<Vec<Triple>> = (0..120).map(|_| identity.clone()).collect();
        let truth = vec![true, true];

        let net = Net::new(config, &comm, &pool, 2, feature_triples, layer_triples, truth).unwrap();
        let outcome = net.run(&comm, &pool, &topology).unwrap();
        assert!(outcome.challenge_pass);
    }
}
