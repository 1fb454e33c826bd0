//! A distributed, multi-threaded sparse matrix-sparse matrix multiplication
//! engine for the Graph Challenge sparse DNN inference benchmark: given a
//! sparse feature matrix and a stack of sparse layer weight matrices, it
//! drives `Y_{l+1} = ReLU_cap(Y_l * W_l + b_l)` to a fixed category
//! prediction and checks it against ground truth.

pub mod config;
pub mod csc;
pub mod data_block;
pub mod env;
pub mod error;
pub mod io;
pub mod net;
pub mod spa;
pub mod spgemm;
pub mod tile;
pub mod tiling;
pub mod timing;
pub mod topology;
pub mod triple;

pub use config::{Config, InputType, Parallelism};
pub use env::{Comm, InProcessComm, SoloComm, ThreadPool};
pub use error::{EngineError, Result};
pub use net::{Net, RunOutcome};
pub use tiling::{Tiling, TilingKind, TilingParams, TripleSource};
pub use topology::{NullTopology, RoundRobinTopology, Topology};
pub use triple::Triple;
