//! A trimmed-down version of `plonky2_maybe_rayon`: the same
//! feature-gated fallback between a `rayon` parallel iterator and the
//! sequential `std` iterator, but only the handful of entry points the
//! engine's repartitioning histogram scan uses. The engine's own
//! cross-thread work (the SpGEMM kernel, the tiled layer loop) is driven
//! by the explicit thread pool and barrier in `spdnn_core::env`, not by
//! this shim — this crate exists only for the independent, unordered scan
//! that doesn't participate in that barrier discipline.

#[cfg(feature = "parallel")]
pub use rayon::prelude::{IndexedParallelIterator, ParallelIterator};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

pub trait MaybeParIter<'data> {
    #[cfg(feature = "parallel")]
    type Item: Send + 'data;
    #[cfg(feature = "parallel")]
    type Iter: ParallelIterator<Item = Self::Item>;

    #[cfg(not(feature = "parallel"))]
    type Item;
    #[cfg(not(feature = "parallel"))]
    type Iter: Iterator<Item = Self::Item>;

    fn maybe_par_iter(&'data self) -> Self::Iter;
}

#[cfg(feature = "parallel")]
impl<'data, T> MaybeParIter<'data> for T
where
    T: ?Sized + IntoParallelRefIterator<'data>,
{
    type Item = T::Item;
    type Iter = T::Iter;

    fn maybe_par_iter(&'data self) -> Self::Iter {
        self.par_iter()
    }
}

#[cfg(not(feature = "parallel"))]
impl<'data, T: 'data> MaybeParIter<'data> for [T] {
    type Item = &'data T;
    type Iter = std::slice::Iter<'data, T>;

    fn maybe_par_iter(&'data self) -> Self::Iter {
        self.iter()
    }
}

#[cfg(not(feature = "parallel"))]
impl<'data, T: 'data> MaybeParIter<'data> for Vec<T> {
    type Item = &'data T;
    type Iter = std::slice::Iter<'data, T>;

    fn maybe_par_iter(&'data self) -> Self::Iter {
        self.iter()
    }
}

/// Runs two independent closures, possibly on separate rayon worker threads.
/// Used to overlap the symbolic-phase SPA scan with unrelated bookkeeping
/// when the `parallel` feature is enabled; falls back to sequential
/// execution otherwise.
#[cfg(feature = "parallel")]
pub fn join<A, B, RA, RB>(oper_a: A, oper_b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    rayon::join(oper_a, oper_b)
}

#[cfg(not(feature = "parallel"))]
pub fn join<A, B, RA, RB>(oper_a: A, oper_b: B) -> (RA, RB)
where
    A: FnOnce() -> RA,
    B: FnOnce() -> RB,
{
    (oper_a(), oper_b())
}
