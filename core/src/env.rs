//! Distributed/process-wide runtime primitives: a long-lived value
//! threading rank/size, a collective `Comm`, and a process-local thread
//! pool through every component that needs them, replacing the original
//! engine's implicit global process state and singleton MPI handle.
//!
//! No MPI crate exists anywhere in the retrieval pack this engine was
//! grown from, so `Comm` is a trait with one concrete implementation,
//! [`InProcessComm`], that simulates a rank group with OS threads,
//! `std::sync::mpsc`-style mailboxes, and a `std::sync::Barrier` — enough
//! to exercise every collective the core calls, and to prove
//! multi-rank behavior without a real network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;

use crate::error::{EngineError, Result};

/// A collective + point-to-point messaging capability scoped to one rank
/// within a process group of `size()` peers.
pub trait Comm: Send + Sync {
    fn rank(&self) -> u32;
    fn size(&self) -> u32;

    /// Blocks every rank in the group until all have called `barrier`.
    fn barrier(&self);

    fn send(&self, dest: u32, tag: u32, data: Vec<u8>) -> Result<()>;
    fn recv(&self, src: u32, tag: u32) -> Result<Vec<u8>>;

    /// `root` provides `data`; every other rank returns `root`'s value.
    fn broadcast(&self, root: u32, tag: u32, data: Vec<u8>) -> Result<Vec<u8>>;

    /// Every rank contributes `data`; every rank returns the full set,
    /// indexed by source rank.
    fn all_gather(&self, tag: u32, data: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Logical AND across every rank's contribution (used for the final
    /// challenge-pass reduction).
    fn all_reduce_and(&self, tag: u32, value: bool) -> Result<bool> {
        let gathered = self.all_gather(tag, vec![value as u8])?;
        Ok(gathered.iter().all(|v| v.first() == Some(&1)))
    }
}

struct Inner {
    barrier: Barrier,
    mailbox: Mutex<HashMap<(u32, u32, u32), VecDeque<Vec<u8>>>>,
    cv: Condvar,
}

/// A `Comm` group simulated entirely in-process: every "rank" is an OS
/// thread sharing one [`Inner`] via `Arc`. Real deployments would swap this
/// for an MPI or gRPC-backed implementation behind the same trait; nothing
/// above the `Comm` boundary would change.
pub struct InProcessComm {
    rank: u32,
    size: u32,
    inner: Arc<Inner>,
}

impl InProcessComm {
    /// Builds one handle per rank in a fresh group of `size` peers, meant
    /// to be handed one-per-thread to a `thread::scope` fan-out.
    pub fn new_group(size: u32) -> Vec<InProcessComm> {
        assert!(size > 0, "a process group must have at least one rank");
        let inner = Arc::new(Inner {
            barrier: Barrier::new(size as usize),
            mailbox: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| InProcessComm { rank, size, inner: inner.clone() })
            .collect()
    }

    fn deliver(&self, src: u32, dest: u32, tag: u32, data: Vec<u8>) {
        let mut mb = self.inner.mailbox.lock().unwrap();
        mb.entry((src, dest, tag)).or_default().push_back(data);
        self.inner.cv.notify_all();
    }

    fn collect(&self, src: u32, tag: u32) -> Vec<u8> {
        let mut mb = self.inner.mailbox.lock().unwrap();
        loop {
            if let Some(q) = mb.get_mut(&(src, self.rank, tag)) {
                if let Some(data) = q.pop_front() {
                    return data;
                }
            }
            mb = self.inner.cv.wait(mb).unwrap();
        }
    }
}

impl Comm for InProcessComm {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn barrier(&self) {
        self.inner.barrier.wait();
    }

    fn send(&self, dest: u32, tag: u32, data: Vec<u8>) -> Result<()> {
        if dest >= self.size {
            return Err(EngineError::CommFailure(format!(
                "send to out-of-range rank {dest} (group size {})",
                self.size
            )));
        }
        self.deliver(self.rank, dest, tag, data);
        Ok(())
    }

    fn recv(&self, src: u32, tag: u32) -> Result<Vec<u8>> {
        if src >= self.size {
            return Err(EngineError::CommFailure(format!(
                "recv from out-of-range rank {src} (group size {})",
                self.size
            )));
        }
        Ok(self.collect(src, tag))
    }

    fn broadcast(&self, root: u32, tag: u32, data: Vec<u8>) -> Result<Vec<u8>> {
        if self.rank == root {
            for dest in 0..self.size {
                if dest != self.rank {
                    self.deliver(self.rank, dest, tag, data.clone());
                }
            }
            Ok(data)
        } else {
            Ok(self.collect(root, tag))
        }
    }

    fn all_gather(&self, tag: u32, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        for dest in 0..self.size {
            if dest != self.rank {
                self.deliver(self.rank, dest, tag, data.clone());
            }
        }
        let mut out = Vec::with_capacity(self.size as usize);
        for src in 0..self.size {
            if src == self.rank {
                out.push(data.clone());
            } else {
                out.push(self.collect(src, tag));
            }
        }
        Ok(out)
    }
}

/// A degenerate, single-member `Comm` for tilings that are locally
/// replicated rather than distributed (layer weight tilings: weights are
/// read identically by every rank, so no exchange ever crosses the wire).
/// Collective calls are trivial no-ops; point-to-point calls would
/// indicate a logic error and fail loudly instead of deadlocking.
pub struct SoloComm;

impl Comm for SoloComm {
    fn rank(&self) -> u32 {
        0
    }

    fn size(&self) -> u32 {
        1
    }

    fn barrier(&self) {}

    fn send(&self, dest: u32, _tag: u32, _data: Vec<u8>) -> Result<()> {
        Err(EngineError::CommFailure(format!("SoloComm has no peer to send to (dest {dest})")))
    }

    fn recv(&self, src: u32, _tag: u32) -> Result<Vec<u8>> {
        Err(EngineError::CommFailure(format!("SoloComm has no peer to receive from (src {src})")))
    }

    fn broadcast(&self, _root: u32, _tag: u32, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }

    fn all_gather(&self, _tag: u32, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![data])
    }
}

/// The process-local pool of worker threads, replacing `omp parallel`
/// regions + `pthread_barrier` with one explicit pool and a reusable
/// barrier, spawned once and reused across every layer.
pub struct ThreadPool {
    nthreads: u32,
    barrier: Barrier,
}

impl ThreadPool {
    pub fn new(nthreads: u32) -> Self {
        assert!(nthreads > 0, "a thread pool must have at least one worker");
        ThreadPool { nthreads, barrier: Barrier::new(nthreads as usize) }
    }

    pub fn nthreads(&self) -> u32 {
        self.nthreads
    }

    /// The pool's single reusable thread barrier: spawned once, reused at
    /// every synchronization point across every layer, never recreated per
    /// layer.
    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// Runs `body(tid)` once per worker, all sharing the scope's lifetime,
    /// and returns their results ordered by `tid`. `body` is responsible
    /// for its own internal layer loop and for calling into a shared
    /// [`std::sync::Barrier`] at its own synchronization points; this
    /// method only owns the spawn/join, not the barrier.
    pub fn scope_run<'a, F, T>(&self, body: F) -> Vec<T>
    where
        F: Fn(u32) -> T + Sync + Send,
        T: Send,
    {
        thread::scope(|s| {
            let body = &body;
            let handles: Vec<_> = (0..self.nthreads)
                .map(|tid| s.spawn(move || body(tid)))
                .collect();
            handles.into_iter().map(|h| h.join().expect("worker thread panicked")).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_releases_all_ranks() {
        let comms = InProcessComm::new_group(4);
        thread::scope(|s| {
            for comm in comms {
                s.spawn(move || comm.barrier());
            }
        });
    }

    #[test]
    fn send_recv_round_trips() {
        let comms = InProcessComm::new_group(2);
        thread::scope(|s| {
            let c0 = &comms[0];
            let c1 = &comms[1];
            s.spawn(move || c0.send(1, 7, vec![1, 2, 3]).unwrap());
            s.spawn(move || {
                let data = c1.recv(0, 7).unwrap();
                assert_eq!(data, vec![1, 2, 3]);
            });
        });
    }

    #[test]
    fn broadcast_delivers_roots_value_to_everyone() {
        let comms = InProcessComm::new_group(3);
        let results: Vec<Vec<u8>> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let payload = if comm.rank() == 0 { vec![42] } else { vec![] };
                        comm.broadcast(0, 1, payload).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in results {
            assert_eq!(r, vec![42]);
        }
    }

    #[test]
    fn all_reduce_and_is_false_if_any_rank_disagrees() {
        let comms = InProcessComm::new_group(3);
        let results: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let mine = comm.rank() != 1;
                        comm.all_reduce_and(9, mine).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|&r| !r));
    }

    #[test]
    fn pool_runs_every_worker_and_preserves_order() {
        let pool = ThreadPool::new(4);
        let results = pool.scope_run(|tid| tid * 2);
        assert_eq!(results, vec![0, 2, 4, 6]);
    }
}
