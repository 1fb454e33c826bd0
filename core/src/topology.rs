//! Thread-pinning and NUMA socket discovery, abstracted as a capability the
//! core consumes rather than calls into directly — the same preference for
//! trait objects at I/O and platform boundaries that backs `util`'s own
//! `GenericConfig`-style capability split.

/// Maps a worker thread index to the NUMA socket its memory should be
/// pinned to. A real deployment would back this with `hwloc` or
/// `/sys/devices/system/node`; the core only ever needs the mapping, never
/// the pinning mechanism itself.
pub trait Topology: Send + Sync {
    fn socket_of(&self, tid: u32) -> u32;
    fn nsockets(&self) -> u32;
}

/// Single-socket fallback: every thread reports socket 0. Correct for any
/// machine that isn't NUMA, and for the in-process `Comm` simulation used
/// by tests and single-host runs.
pub struct NullTopology;

impl Topology for NullTopology {
    fn socket_of(&self, _tid: u32) -> u32 {
        0
    }

    fn nsockets(&self) -> u32 {
        1
    }
}

/// Splits `nthreads` workers evenly across `nsockets` sockets in
/// round-robin order.
pub struct RoundRobinTopology {
    nsockets: u32,
}

impl RoundRobinTopology {
    pub fn new(nsockets: u32) -> Self {
        assert!(nsockets > 0, "a topology must expose at least one socket");
        RoundRobinTopology { nsockets }
    }
}

impl Topology for RoundRobinTopology {
    fn socket_of(&self, tid: u32) -> u32 {
        tid % self.nsockets
    }

    fn nsockets(&self) -> u32 {
        self.nsockets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_topology_pins_everything_to_socket_zero() {
        let topo = NullTopology;
        assert_eq!(topo.socket_of(7), 0);
        assert_eq!(topo.nsockets(), 1);
    }

    #[test]
    fn round_robin_wraps_around_socket_count() {
        let topo = RoundRobinTopology::new(2);
        assert_eq!(topo.socket_of(0), 0);
        assert_eq!(topo.socket_of(1), 1);
        assert_eq!(topo.socket_of(2), 0);
    }
}
