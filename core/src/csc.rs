//! The CSC matrix: grounded on the column-pointer/row-index/value triple
//! (`JA`/`IA`/`A`) the original engine threads through `spops.hpp`'s
//! `spmm_symb`/`spmm_numeric`. Three [`DataBlock`]s back it;
//! capacity may exceed the logical `nnz` (the symbolic phase only ever
//! over-estimates it, never under).

use std::cell::UnsafeCell;

use crate::data_block::DataBlock;
use crate::error::{EngineError, Result};
use crate::spa::Spa;
use crate::triple::{is_col_major_sorted, Triple};

pub struct Csc {
    nrows: u32,
    ncols: u32,
    nnz: u64,
    ja: DataBlock<u32>,
    ia: DataBlock<u32>,
    a: DataBlock<f64>,
}

impl Csc {
    /// An empty matrix with `ncols+1` column-pointer slots and room for
    /// `capacity_nnz` entries, all zeroed.
    pub fn new(capacity_nnz: usize, nrows: u32, ncols: u32, socket: u32) -> Result<Self> {
        let mut ja = DataBlock::new(ncols as usize + 1, socket)?;
        ja.set_len(ncols as usize + 1);
        let ia = DataBlock::new(capacity_nnz, socket)?;
        let a = DataBlock::new(capacity_nnz, socket)?;
        Ok(Csc { nrows, ncols, nnz: 0, ja, ia, a })
    }

    pub fn nrows(&self) -> u32 {
        self.nrows
    }

    pub fn ncols(&self) -> u32 {
        self.ncols
    }

    pub fn nnz(&self) -> u64 {
        self.nnz
    }

    pub fn ja(&self) -> &[u32] {
        &self.ja.as_slice()[..self.ncols as usize + 1]
    }

    pub fn ia(&self) -> &[u32] {
        &self.ia.as_slice()[..self.nnz as usize]
    }

    pub fn values(&self) -> &[f64] {
        &self.a.as_slice()[..self.nnz as usize]
    }

    /// Builds a matrix directly from a column-major-sorted triple stream,
    /// as used for the stationary `B` operand built once from a layer's
    /// weight file. Rejects unsorted input and duplicate `(row, col)`
    /// pairs.
    pub fn populate_from_triples(
        triples: &[Triple],
        nrows: u32,
        ncols: u32,
        socket: u32,
    ) -> Result<Csc> {
        if !is_col_major_sorted(triples) {
            return Err(EngineError::InvariantViolation(
                "triples must be column-major sorted before CSC compression".into(),
            ));
        }
        let nnz = triples.len();
        let mut csc = Csc::new(nnz, nrows, ncols, socket)?;
        {
            let ja = csc.ja.as_capacity_slice_mut();
            let ia = csc.ia.as_capacity_slice_mut();
            let a = csc.a.as_capacity_slice_mut();
            let mut col_cursor: u32 = 0;
            let mut prev: Option<(u32, u32)> = None;
            for (k, t) in triples.iter().enumerate() {
                if t.row >= nrows || t.col >= ncols {
                    return Err(EngineError::InvariantViolation(format!(
                        "triple ({}, {}) out of bounds for a {}x{} matrix",
                        t.row, t.col, nrows, ncols
                    )));
                }
                if prev == Some((t.row, t.col)) {
                    return Err(EngineError::InvariantViolation(format!(
                        "duplicate triple at row {} col {}",
                        t.row, t.col
                    )));
                }
                while col_cursor < t.col {
                    col_cursor += 1;
                    ja[col_cursor as usize] = k as u32;
                }
                ia[k] = t.row;
                a[k] = t.w;
                prev = Some((t.row, t.col));
            }
            while col_cursor < ncols {
                col_cursor += 1;
                ja[col_cursor as usize] = nnz as u32;
            }
        }
        csc.nnz = nnz as u64;
        csc.ia.set_len(nnz);
        csc.a.set_len(nnz);
        Ok(csc)
    }

    /// Grows (or shrinks) the matrix to the symbolic phase's predicted
    /// upper bound. `stripe` is `Some((start_col, end_col))` when only one thread's
    /// column range needs its `JA` slots re-zeroed (data × model, where the
    /// matrix is shared); `None` zeroes the whole of `JA`.
    pub fn reallocate(
        &mut self,
        new_nnz: u64,
        nrows: u32,
        ncols: u32,
        stripe: Option<(u32, u32)>,
    ) -> Result<()> {
        let ja_capacity_needed = ncols as usize + 1;
        let grew_ja = self.ja.capacity() < ja_capacity_needed;
        self.ja.reallocate(ja_capacity_needed)?;
        self.ia.reallocate(new_nnz as usize)?;
        self.a.reallocate(new_nnz as usize)?;
        self.nrows = nrows;
        self.ncols = ncols;
        self.nnz = new_nnz;
        self.ja.set_len(ja_capacity_needed);
        self.ia.set_len(new_nnz as usize);
        self.a.set_len(new_nnz as usize);
        if !grew_ja {
            let ja = self.ja.as_capacity_slice_mut();
            match stripe {
                Some((start, end)) => {
                    for v in ja[start as usize..=end as usize].iter_mut() {
                        *v = 0;
                    }
                }
                None => {
                    for v in ja.iter_mut() {
                        *v = 0;
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes column `col`'s entries from the SPA: adds `bias`, applies the
    /// ReLU cap, and emits only rows that survive as nonzero, advancing
    /// `idx_nnz` and zeroing every SPA slot it reads.
    ///
    /// Takes `&self`: the caller holds exclusive ownership of the column
    /// range `col` falls in (either the whole matrix, in data × data, or a
    /// disjoint thread stripe, in data × model), so concurrent calls from
    /// other threads on other columns never race on `ia`/`a`. `idx_nnz` is
    /// private per-thread state, not read from `self`.
    pub fn populate_column_from_spa(
        &self,
        spa: &mut Spa,
        bias: f64,
        col: u32,
        idx_nnz: &mut u64,
    ) -> Result<()> {
        if col as usize + 1 >= self.ja.capacity() {
            return Err(EngineError::DimensionMismatch(format!(
                "column {col} out of range for a {}-column matrix",
                self.ncols
            )));
        }
        for i in 0..self.nrows as usize {
            let raw = spa.take(i);
            if raw == 0.0 {
                continue;
            }
            let v = (raw + bias).max(0.0).min(crate::config::RELU_CAP);
            if v == 0.0 {
                continue;
            }
            let slot = *idx_nnz as usize;
            if slot >= self.ia.capacity() {
                return Err(EngineError::InvariantViolation(
                    "numeric phase emitted more entries than the symbolic phase allocated".into(),
                ));
            }
            unsafe {
                self.ia.write_unchecked(slot, i as u32);
                self.a.write_unchecked(slot, v);
            }
            *idx_nnz += 1;
        }
        unsafe {
            self.ja.write_unchecked(col as usize + 1, *idx_nnz as u32);
        }
        Ok(())
    }

    /// Truncates the logical `nnz` down to the true count emitted by a
    /// single-owner numeric pass (see DESIGN.md): in data × data each
    /// thread's tile has no other writer, so no mid-array gap can form and
    /// only a tail truncation is needed.
    pub fn finalize_tail(&mut self, final_nnz: u64) {
        self.nnz = final_nnz;
        self.ia.set_len(final_nnz as usize);
        self.a.set_len(final_nnz as usize);
    }

    /// Removes the mid-array gaps the symbolic phase's per-thread
    /// over-allocation leaves behind when several threads write disjoint
    /// column stripes of one shared matrix (data × model). `reports` must
    /// be ordered by ascending `start_col` (equivalently, by the prefix-sum
    /// offset each thread was handed before the numeric pass). Must run
    /// single-threaded, after every writer thread has crossed the
    /// post-numeric-phase barrier.
    pub fn adjust_stripes(&mut self, reports: &[StripeReport]) -> Result<()> {
        let mut compacted: u64 = 0;
        for r in reports {
            let delta = r.old_offset.checked_sub(compacted).ok_or_else(|| {
                EngineError::InvariantViolation(
                    "stripe reports out of order during adjust".into(),
                )
            })?;
            if delta > 0 {
                let src = r.old_offset as usize;
                let len = r.actual_count as usize;
                let dst = compacted as usize;
                if len > 0 {
                    self.ia.as_capacity_slice_mut().copy_within(src..src + len, dst);
                    self.a.as_capacity_slice_mut().copy_within(src..src + len, dst);
                }
                let ja = self.ja.as_capacity_slice_mut();
                for c in r.start_col..r.end_col {
                    ja[c as usize + 1] -= delta as u32;
                }
            }
            compacted += r.actual_count;
        }
        self.nnz = compacted;
        self.ia.set_len(compacted as usize);
        self.a.set_len(compacted as usize);
        Ok(())
    }

    /// Re-expands the matrix back into `(row, col, weight)` triples, used by
    /// the triple-exchange phase of tiling and by `text2bin`'s inverse.
    pub fn to_triples(&self) -> Vec<Triple> {
        let ja = self.ja();
        let mut out = Vec::with_capacity(self.nnz as usize);
        for col in 0..self.ncols {
            let start = ja[col as usize] as usize;
            let end = ja[col as usize + 1] as usize;
            for k in start..end {
                out.push(Triple::new(self.ia()[k], col, self.values()[k]));
            }
        }
        out
    }
}

/// One thread's contribution to a shared matrix's numeric pass, collected
/// after the post-numeric barrier and fed to [`Csc::adjust_stripes`].
#[derive(Debug, Clone, Copy)]
pub struct StripeReport {
    pub start_col: u32,
    pub end_col: u32,
    pub old_offset: u64,
    pub actual_count: u64,
}

/// Interior-mutable wrapper letting several worker threads hold a shared
/// reference to one matrix at once, each writing only its own disjoint
/// column range, with a single designated thread taking a transient
/// exclusive view to reallocate or compact between layers.
///
/// This replaces the original engine's `shared_ptr`-shared CSC: ownership
/// stays with whichever tile holds the `SharedCsc`, and threads borrow it
/// for the duration of one layer through this capability rather than
/// cloning or reference-counting the payload itself.
pub struct SharedCsc(UnsafeCell<Csc>);

unsafe impl Send for SharedCsc {}
unsafe impl Sync for SharedCsc {}

impl SharedCsc {
    pub fn new(csc: Csc) -> Self {
        SharedCsc(UnsafeCell::new(csc))
    }

    pub fn get(&self) -> &Csc {
        unsafe { &*self.0.get() }
    }

    /// # Safety
    /// The caller must ensure no other thread holds any reference (shared
    /// or exclusive) to this matrix for the duration of the borrow —
    /// enforced in practice by calling this only from the thread that owns
    /// the post-barrier reallocate/adjust step of a layer.
    pub unsafe fn get_mut_exclusive(&self) -> &mut Csc {
        &mut *self.0.get()
    }

    pub fn into_inner(self) -> Csc {
        self.0.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(row: u32, col: u32, w: f64) -> Triple {
        Triple::new(row, col, w)
    }

    #[test]
    fn populate_from_triples_builds_well_formed_csc() {
        let triples = vec![t(0, 0, 1.0), t(2, 0, 2.0), t(1, 1, 3.0)];
        let csc = Csc::populate_from_triples(&triples, 3, 2, 0).unwrap();
        assert_eq!(csc.nnz(), 3);
        assert_eq!(csc.ja(), &[0, 2, 3]);
        assert_eq!(csc.ia(), &[0, 2, 1]);
        assert_eq!(csc.values(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn populate_from_triples_rejects_unsorted_input() {
        let triples = vec![t(0, 1, 1.0), t(0, 0, 1.0)];
        assert!(Csc::populate_from_triples(&triples, 2, 2, 0).is_err());
    }

    #[test]
    fn populate_from_triples_rejects_duplicates() {
        let triples = vec![t(0, 0, 1.0), t(0, 0, 2.0)];
        assert!(Csc::populate_from_triples(&triples, 1, 1, 0).is_err());
    }

    #[test]
    fn round_trips_through_to_triples() {
        let triples = vec![t(0, 0, 1.0), t(2, 0, 2.0), t(1, 1, 3.0)];
        let csc = Csc::populate_from_triples(&triples, 3, 2, 0).unwrap();
        let mut back = csc.to_triples();
        back.sort_by_key(|tr| (tr.col, tr.row));
        let mut expected = triples;
        expected.sort_by_key(|tr| (tr.col, tr.row));
        assert_eq!(back, expected);
    }

    #[test]
    fn populate_column_from_spa_applies_bias_and_relu_cap() {
        let csc = Csc::new(4, 2, 2, 0).unwrap();
        let mut csc = csc;
        csc.reallocate(4, 2, 2, None).unwrap();
        let mut spa = Spa::new(2, 0).unwrap();
        let mut idx_nnz = 0u64;

        // Column 0: row 0 gets killed by bias, row 1 survives.
        spa.accumulate(0, 0.2);
        spa.accumulate(1, 5.0);
        csc.populate_column_from_spa(&mut spa, -0.3, 0, &mut idx_nnz).unwrap();
        spa.assert_zeroed();
        assert_eq!(idx_nnz, 1);

        // Column 1: row 0 would exceed the cap and gets clamped to 32.0.
        spa.accumulate(0, 100.0);
        csc.populate_column_from_spa(&mut spa, -0.3, 1, &mut idx_nnz).unwrap();
        spa.assert_zeroed();

        csc.finalize_tail(idx_nnz);
        let triples = csc.to_triples();
        assert_eq!(triples.len(), 2);
        assert!(triples.contains(&t(1, 0, 4.7)));
        assert!(triples.contains(&t(0, 1, 32.0)));
    }

    #[test]
    fn adjust_stripes_removes_gaps_and_rebases_ja() {
        // Two threads each allocated 2 slots by the symbolic estimate, but
        // thread 0 only actually emits 1 entry and thread 1 emits 2.
        let mut csc = Csc::new(4, 4, 4, 0).unwrap();
        csc.reallocate(4, 4, 4, None).unwrap();
        unsafe {
            csc.ia.write_unchecked(0, 0);
            csc.a.write_unchecked(0, 1.0);
            csc.ja.write_unchecked(1, 1); // col 0 -> [0,1)
            csc.ja.write_unchecked(2, 1); // col 1 -> [1,1) empty

            csc.ia.write_unchecked(2, 0);
            csc.a.write_unchecked(2, 2.0);
            csc.ia.write_unchecked(3, 1);
            csc.a.write_unchecked(3, 3.0);
            csc.ja.write_unchecked(3, 3); // col 2 -> [2,3)
            csc.ja.write_unchecked(4, 4); // col 3 -> [3,4)
        }
        let reports = vec![
            StripeReport { start_col: 0, end_col: 2, old_offset: 0, actual_count: 1 },
            StripeReport { start_col: 2, end_col: 4, old_offset: 2, actual_count: 2 },
        ];
        csc.adjust_stripes(&reports).unwrap();
        assert_eq!(csc.nnz(), 3);
        assert_eq!(csc.ja(), &[0, 1, 1, 2, 3]);
        assert_eq!(csc.ia(), &[0, 0, 1]);
        assert_eq!(csc.values(), &[1.0, 2.0, 3.0]);
    }
}
