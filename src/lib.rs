pub mod apply;
pub mod assembler;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod memory;
pub mod replicator;
pub mod shutdown;

pub mod postgres;

pub use apply::{ApplyEngine, ApplyOutcome, Target};
pub use assembler::TransactionAssembler;
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::Config;
pub use error::{Error, Result};
pub use replicator::{ChangeSource, CycleOutcome, Replicator, ReplicatorSettings, ReplicatorStats};
