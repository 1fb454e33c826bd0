//! The two-phase SpGEMM kernel, grounded on
//! `original_source/src/spops.hpp`'s `spmm_symb`/`spmm_numeric` free
//! functions. Both operate on a thread's column stripe of `B`
//! (`[start_col, end_col)`); the caller picks the full range for
//! data × data or a partition of it for data × model.

use crate::csc::Csc;
use crate::error::{EngineError, Result};
use crate::spa::Spa;

fn check_dimensions(a: &Csc, b: &Csc) -> Result<()> {
    if a.ncols() != b.nrows() {
        return Err(EngineError::DimensionMismatch(format!(
            "A.ncols ({}) != B.nrows ({}) at SpGEMM entry",
            a.ncols(),
            b.nrows()
        )));
    }
    Ok(())
}

/// Symbolic sizing pass: counts how many entries the numeric pass will
/// emit for columns `[start_col, end_col)` of `C = A·B`, without computing
/// any values. Leaves `spa` fully zeroed on return.
pub fn spmm_symb(a: &Csc, b: &Csc, spa: &mut Spa, start_col: u32, end_col: u32) -> Result<u64> {
    check_dimensions(a, b)?;
    let (ja_b, ia_b) = (b.ja(), b.ia());
    let (ja_a, ia_a) = (a.ja(), a.ia());
    let mut nnz_local = 0u64;
    for j in start_col..end_col {
        for k in ja_b[j as usize]..ja_b[j as usize + 1] {
            let l = ia_b[k as usize];
            for n in ja_a[l as usize]..ja_a[l as usize + 1] {
                spa.touch(ia_a[n as usize] as usize);
            }
        }
        for i in 0..a.nrows() as usize {
            if spa.get(i) != 0.0 {
                nnz_local += 1;
                spa.take(i);
            }
        }
    }
    Ok(nnz_local)
}

/// Numeric pass: accumulates columns `[start_col, end_col)` of `A·B` into
/// `spa`, then drains each column into `c` at `off_col + j` with bias and
/// the ReLU cap fused in (`Csc::populate_column_from_spa`). `c` must
/// already be sized to the symbolic pass's `nnz_local` (or the cross-thread
/// prefix sum of it, for data × model).
pub fn spmm_numeric(
    a: &Csc,
    b: &Csc,
    c: &Csc,
    spa: &mut Spa,
    bias: f64,
    start_col: u32,
    end_col: u32,
    off_col: u32,
    idx_nnz: &mut u64,
) -> Result<()> {
    check_dimensions(a, b)?;
    let (ja_b, ia_b, val_b) = (b.ja(), b.ia(), b.values());
    let (ja_a, ia_a, val_a) = (a.ja(), a.ia(), a.values());
    for j in start_col..end_col {
        for k in ja_b[j as usize]..ja_b[j as usize + 1] {
            let bw = val_b[k as usize];
            let l = ia_b[k as usize];
            for n in ja_a[l as usize]..ja_a[l as usize + 1] {
                spa.accumulate(ia_a[n as usize] as usize, bw * val_a[n as usize]);
            }
        }
        c.populate_column_from_spa(spa, bias, off_col + j, idx_nnz)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triple::Triple;

    fn csc(triples: &[(u32, u32, f64)], nrows: u32, ncols: u32) -> Csc {
        let mut t: Vec<Triple> = triples.iter().map(|&(r, c, w)| Triple::new(r, c, w)).collect();
        crate::triple::sort_col_major(&mut t);
        Csc::populate_from_triples(&t, nrows, ncols, 0).unwrap()
    }

    #[test]
    fn identity_times_identity_is_identity() {
        let a = csc(&[(0, 0, 1.0), (1, 1, 1.0)], 2, 2);
        let b = csc(&[(0, 0, 1.0), (1, 1, 1.0)], 2, 2);
        let mut spa = Spa::new(2, 0).unwrap();
        let nnz = spmm_symb(&a, &b, &mut spa, 0, 2).unwrap();
        spa.assert_zeroed();
        assert_eq!(nnz, 2);

        let mut c = Csc::new(nnz as usize, 2, 2, 0).unwrap();
        c.reallocate(nnz, 2, 2, None).unwrap();
        let mut idx = 0u64;
        spmm_numeric(&a, &b, &c, &mut spa, 0.0, 0, 2, 0, &mut idx).unwrap();
        spa.assert_zeroed();
        c.finalize_tail(idx);
        let mut out = c.to_triples();
        out.sort_by_key(|t| (t.col, t.row));
        assert_eq!(out, vec![Triple::new(0, 0, 1.0), Triple::new(1, 1, 1.0)]);
    }

    #[test]
    fn cap_boundary_clamps_to_32() {
        let a = csc(&[(0, 0, 1.0)], 1, 1);
        let b = csc(&[(0, 0, 100.0)], 1, 1);
        let mut spa = Spa::new(1, 0).unwrap();
        let nnz = spmm_symb(&a, &b, &mut spa, 0, 1).unwrap();
        let mut c = Csc::new(nnz as usize, 1, 1, 0).unwrap();
        c.reallocate(nnz, 1, 1, None).unwrap();
        let mut idx = 0u64;
        spmm_numeric(&a, &b, &c, &mut spa, 0.0, 0, 1, 0, &mut idx).unwrap();
        c.finalize_tail(idx);
        assert_eq!(c.to_triples(), vec![Triple::new(0, 0, 32.0)]);
    }

    #[test]
    fn bias_kill_produces_no_entry() {
        let a = csc(&[(0, 0, 1.0)], 1, 1);
        let b = csc(&[(0, 0, 0.2)], 1, 1);
        let mut spa = Spa::new(1, 0).unwrap();
        let nnz = spmm_symb(&a, &b, &mut spa, 0, 1).unwrap();
        assert_eq!(nnz, 1); // symbolic over-estimates: row touched before bias.
        let mut c = Csc::new(nnz as usize, 1, 1, 0).unwrap();
        c.reallocate(nnz, 1, 1, None).unwrap();
        let mut idx = 0u64;
        spmm_numeric(&a, &b, &c, &mut spa, -0.3, 0, 1, 0, &mut idx).unwrap();
        c.finalize_tail(idx);
        assert_eq!(c.nnz(), 0);
        assert_eq!(c.to_triples(), vec![]);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let a = csc(&[(0, 0, 1.0)], 1, 1);
        let b = csc(&[(0, 0, 1.0), (1, 0, 1.0)], 2, 2);
        let mut spa = Spa::new(2, 0).unwrap();
        assert!(spmm_symb(&a, &b, &mut spa, 0, 2).is_err());
    }
}
