//! Sparse accumulator: one dense scratch vector per worker thread, pinned
//! to that thread's socket, reused across every column of every layer for
//! the run's lifetime.

use crate::data_block::DataBlock;
use crate::error::Result;

pub struct Spa {
    values: DataBlock<f64>,
}

impl Spa {
    /// `len` must be at least the row dimension of the `A` operand the
    /// owning thread will ever multiply against.
    pub fn new(len: usize, socket: u32) -> Result<Self> {
        let mut values = DataBlock::new(len, socket)?;
        values.set_len(len);
        Ok(Spa { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Accumulates `delta` into row `i`. Used by the numeric phase's inner
    /// product loop.
    pub fn accumulate(&mut self, i: usize, delta: f64) {
        self.values.as_mut_slice()[i] += delta;
    }

    /// Marks row `i` as touched without contributing a value yet, used by
    /// the symbolic phase (`SPA[IA[n]] = 1`). Any nonzero sentinel works
    /// since the symbolic phase only tests for nonzero-ness.
    pub fn touch(&mut self, i: usize) {
        self.values.as_mut_slice()[i] = 1.0;
    }

    pub fn get(&self, i: usize) -> f64 {
        self.values.as_slice()[i]
    }

    /// Zeros row `i` and returns its prior value. The symbolic and numeric
    /// phases both drain every slot they touched back to zero before
    /// returning, so the accumulator is clean for the next column.
    pub fn take(&mut self, i: usize) -> f64 {
        let slot = &mut self.values.as_mut_slice()[i];
        let v = *slot;
        *slot = 0.0;
        v
    }

    /// Debug/test helper: asserts every slot is exactly zero.
    pub fn assert_zeroed(&self) {
        debug_assert!(
            self.values.as_slice().iter().all(|&v| v == 0.0),
            "SPA zero invariant violated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_and_take_round_trips() {
        let mut spa = Spa::new(4, 0).unwrap();
        spa.accumulate(1, 3.0);
        spa.accumulate(1, 4.0);
        assert_eq!(spa.get(1), 7.0);
        assert_eq!(spa.take(1), 7.0);
        assert_eq!(spa.get(1), 0.0);
    }

    #[test]
    fn fresh_spa_is_zeroed() {
        let spa = Spa::new(8, 0).unwrap();
        spa.assert_zeroed();
    }
}
