//! Snowman consensus: the linear-chain decision state and the transitive
//! engine that drives it.
//!
//! # Architecture
//!
//! - **Consensus / Snowman**: repeated-sampling decision state over a linear
//!   chain of blocks
//! - **Transitive**: the event-driven engine; fetches missing ancestry,
//!   schedules dependency-blocked work, dispatches queries, and bubbles
//!   stale votes to processing ancestors
//! - **ChainVM / Sender / Validators**: the external collaborators the
//!   engine is wired to
//!
//! The engine is a single logical actor: its caller serializes every handler
//! invocation, and all internal state is unsynchronized.
//!
//! # Example
//!
//! ```
//! use avalanche_snowman::{Parameters, Snowman};
//!
//! let params = Parameters::default();
//! let snowman = Snowman::new(params);
//! ```

mod ancestor;
mod block;
mod cache;
mod consensus;
mod engine;
mod error;
mod event;
mod metrics;
mod params;
mod poll;
mod sender;
#[cfg(test)]
mod testing;
mod validators;
mod vm;

pub use ancestor::AncestorTree;
pub use block::{Block, BlockOptions, BlockRef};
pub use cache::SizedLru;
pub use consensus::{snowman::Snowman, Consensus, Status};
pub use engine::{Config, Message, Request, Transitive, NON_VERIFIED_CACHE_SIZE};
pub use error::{ConsensusError, Result};
pub use event::{Blocker, Ready};
pub use metrics::{Counter, EngineMetrics, Gauge, Histogram, IssueSource, Registry};
pub use params::Parameters;
pub use poll::PollSet;
pub use sender::Sender;
pub use validators::{Validator, ValidatorSet, Validators};
pub use vm::{ChainVM, State};
