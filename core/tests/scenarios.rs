//! End-to-end scenarios and cross-module properties that don't fit neatly
//! into one module's `#[cfg(test)]` block: multi-layer chains, repartition
//! locality, and the distributed-vs-single-rank equivalence check.

use spdnn_core::config::{Config, InputType, Parallelism};
use spdnn_core::csc::Csc;
use spdnn_core::env::{Comm, InProcessComm, ThreadPool};
use spdnn_core::net::Net;
use spdnn_core::spa::Spa;
use spdnn_core::spgemm::{spmm_numeric, spmm_symb};
use spdnn_core::tile::TilePayload;
use spdnn_core::tiling::{Tiling, TilingKind, TilingParams, TripleSource};
use spdnn_core::topology::NullTopology;
use spdnn_core::triple::Triple;

fn t(row: u32, col: u32, w: f64) -> Triple {
    Triple::new(row, col, w)
}

fn csc_from(triples: &[Triple], nrows: u32, ncols: u32) -> Csc {
    let mut sorted = triples.to_vec();
    spdnn_core::triple::sort_col_major(&mut sorted);
    Csc::populate_from_triples(&sorted, nrows, ncols, 0).unwrap()
}

fn one_layer(a: &Csc, b: &Csc, bias: f64) -> Csc {
    let mut spa = Spa::new(a.nrows() as usize, 0).unwrap();
    let nnz = spmm_symb(a, b, &mut spa, 0, b.ncols()).unwrap();
    let mut c = Csc::new(nnz as usize, a.nrows(), b.ncols(), 0).unwrap();
    c.reallocate(nnz, a.nrows(), b.ncols(), None).unwrap();
    let mut idx = 0u64;
    spmm_numeric(a, b, &c, &mut spa, bias, 0, b.ncols(), 0, &mut idx).unwrap();
    c.finalize_tail(idx);
    c
}

fn categories_of(csc: &Csc) -> Vec<bool> {
    let mut hit = vec![false; csc.nrows() as usize];
    for &row in csc.ia() {
        hit[row as usize] = true;
    }
    hit
}

/// `A = [[1,0],[0,1]]`, `W_0 = W_1 = [[1,1],[0,1]]`, bias `-0.3`. After
/// layer 0: `[[0.7,0.7],[0,0.7]]`; after layer 1: `[[0.4,1.1],[0,0.4]]`;
/// categories `[1, 1]`.
#[test]
fn two_layer_propagation_matches_hand_derived_values() {
    let a = csc_from(&[t(0, 0, 1.0), t(1, 1, 1.0)], 2, 2);
    let w = csc_from(&[t(0, 0, 1.0), t(0, 1, 1.0), t(1, 1, 1.0)], 2, 2);

    let y1 = one_layer(&a, &w, -0.3);
    let mut y1_triples = y1.to_triples();
    y1_triples.sort_by_key(|tr| (tr.col, tr.row));
    assert_eq!(y1_triples, vec![t(0, 0, 0.7), t(0, 1, 0.7), t(1, 1, 0.7)]);

    let y2 = one_layer(&y1, &w, -0.3);
    let mut y2_triples = y2.to_triples();
    y2_triples.sort_by_key(|tr| (tr.col, tr.row));
    assert_eq!(y2_triples, vec![t(0, 0, 0.4), t(0, 1, 1.1), t(1, 1, 0.4)]);

    assert_eq!(categories_of(&y2), vec![true, true]);
}

/// `A` with one nonzero in row 3, `W_0` zero column for that feature, any
/// bias. Every row drops out, category `[0,0,0,0]`.
#[test]
fn sparse_drop_produces_no_category() {
    let a = csc_from(&[t(3, 0, 5.0)], 4, 1);
    // Column 0 of W has no entries: row 3's only contribution vanishes.
    let w = csc_from(&[], 1, 1);
    let y = one_layer(&a, &w, -0.3);
    assert_eq!(categories_of(&y), vec![false, false, false, false]);
}

/// Every tile a `Tiling` hands out after repartitioning still satisfies
/// its own row/col extent, and the global edge count survives the
/// all-to-all exchange and repartition.
#[test]
fn repartition_preserves_locality_and_triple_count() {
    let comm = InProcessComm::new_group(1).remove(0);
    let triples = vec![t(0, 0, 1.0), t(5, 1, 2.0), t(9, 2, 3.0), t(3, 3, 4.0)];
    let params = TilingParams {
        ntiles: 2,
        nrowgrps: 2,
        ncolgrps: 1,
        nranks: 1,
        nthreads: 2,
        nnz: triples.len() as u64,
        nrows: 10,
        ncols: 4,
        kind: TilingKind::Row1D,
        input_source: TripleSource::None,
        repartition: true,
    };
    let tiling = Tiling::build(params, triples, &comm).unwrap();
    assert_eq!(tiling.total_nedges(), 4);
    for i in 0..tiling.nrowgrps() {
        for j in 0..tiling.ncolgrps() {
            let tile = tiling.tile(i, j);
            if let Some(csc) = tile.csc() {
                for tr in csc.to_triples() {
                    let global_row = tr.row + tile.start_row;
                    let global_col = tr.col + tile.start_col;
                    assert!(tile.contains(global_row, global_col));
                }
            }
        }
    }
}

/// A `nranks=2, nthreads=2` run must agree with a `nranks=1, nthreads=1`
/// run on the same inputs. Both are checked against the same
/// hand-derived ground truth, which only holds if both configurations
/// compute the same categories.
#[test]
fn distributed_split_matches_single_rank() {
    fn build_layers(n_layers: u32) -> Vec<Vec<Triple>> {
        // Weight 2.0 on the diagonal overcomes the -0.3 bias (n_neurons =
        // 1024) so every row saturates at the ReLU cap instead of
        // decaying to zero after enough layers.
        let identity: Vec<Triple> = (0..1024u32).map(|i| t(i, i, 2.0)).collect();
        (0..n_layers).map(|_| identity.clone()).collect()
    }

    fn run(nranks: u32, nthreads: u32) -> bool {
        let config =
            Config::new(1024, 120, "in", "layers", Parallelism::DataXData, InputType::Text).unwrap();
        let feature_triples: Vec<Triple> = (0..4u32).map(|i| t(i, i, 1.0)).collect();
        let layer_triples = build_layers(config.n_layers);
        let truth = vec![true, true, true, true];

        let comms = InProcessComm::new_group(nranks);
        let pool = ThreadPool::new(nthreads);
        let topology = NullTopology;
        let mut all_pass = true;
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let config = config.clone();
                    let feature_triples =
                        if comm.rank() == 0 { feature_triples.clone() } else { Vec::new() };
                    let layer_triples = layer_triples.clone();
                    let truth = truth.clone();
                    let pool = &pool;
                    let topology = &topology;
                    scope.spawn(move || {
                        let net =
                            Net::new(config, &comm, pool, 4, feature_triples, layer_triples, truth).unwrap();
                        net.run(&comm, pool, topology).unwrap().challenge_pass
                    })
                })
                .collect();
            for h in handles {
                all_pass &= h.join().unwrap();
            }
        });
        all_pass
    }

    assert!(run(1, 1));
    assert!(run(2, 2));
}

/// `data x data` and `data x model` must derive the same categories from
/// the same inputs, run with `nthreads > 1` so each strategy actually
/// exercises its own buffer-ownership scheme: per-thread row tiles for
/// data x data, the shared rank-level buffer with column-striped threads
/// and `adjust_stripes` compaction for data x model.
#[test]
fn data_x_data_and_data_x_model_agree_on_categories() {
    fn run_strategy(parallelism: Parallelism) -> Vec<bool> {
        let config = Config::new(1024, 120, "in", "layers", parallelism, InputType::Text).unwrap();
        let feature_triples: Vec<Triple> = (0..4u32).map(|i| t(i, i, 1.0)).collect();
        // Weight 2.0 on the diagonal overcomes the -0.3 bias (n_neurons =
        // 1024) so every instance saturates at the ReLU cap after 120 layers.
        let identity: Vec<Triple> = (0..1024u32).map(|i| t(i, i, 2.0)).collect();
        let layer_triples: Vec<Vec<Triple>> = (0..config.n_layers).map(|_| identity.clone()).collect();
        let truth = vec![true, true, true, true];

        let comm = InProcessComm::new_group(1).remove(0);
        let pool = ThreadPool::new(2);
        let topology = NullTopology;
        let net = Net::new(config, &comm, &pool, 4, feature_triples, layer_triples, truth).unwrap();
        net.run(&comm, &pool, &topology).unwrap().categories
    }

    assert_eq!(run_strategy(Parallelism::DataXData), run_strategy(Parallelism::DataXModel));
}

/// A tile's payload is compressed at most once per tiling; confirms
/// `compress_owned_tiles` actually replaces the triple buffer rather than
/// leaving both representations live.
#[test]
fn owned_tiles_end_up_compressed() {
    let comm = InProcessComm::new_group(1).remove(0);
    let params = TilingParams {
        ntiles: 1,
        nrowgrps: 1,
        ncolgrps: 1,
        nranks: 1,
        nthreads: 1,
        nnz: 1,
        nrows: 2,
        ncols: 2,
        kind: TilingKind::Row1D,
        input_source: TripleSource::None,
        repartition: false,
    };
    let tiling = Tiling::build(params, vec![t(0, 0, 1.0)], &comm).unwrap();
    assert!(matches!(tiling.tile(0, 0).csc(), Some(_)));
    assert!(!matches!(
        &tiling.tile(0, 0),
        spdnn_core::tile::Tile { payload: TilePayload::Triples(_), .. }
    ));
}
