//! Port knocking: ordered UDP/TCP/ICMP knock sequences, plus reachability
//! checks of the resource the knock is meant to open.

pub mod config;
pub mod dns;
pub mod error;
pub mod events;
pub mod executor;
pub mod http;
pub mod icmp;
pub mod knocker;
pub mod payload;
pub mod probe;
pub mod public_ip;
pub mod report;
pub mod sequence;
pub mod store;
pub mod transport;
pub mod utils;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use error::KnockError;
pub use executor::{CancelToken, ExecutionOutcome, Executor};
pub use knocker::{KnockOptions, Knocker, SystemKnocker};
pub use sequence::{Sequence, SequenceId, SequenceStep};
