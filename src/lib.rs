//! Traffic classification and hierarchical Top-N aggregation for sampled
//! network captures.
//!
//! Capture files are decoded frame by frame ([`parser`]), assigned a
//! hierarchical category ([`detection`]), counted ([`counters`]) and persisted
//! as one statistics file per capture ([`store`]). A long-running aggregator
//! ([`scan`]) folds those files into calendar windows ([`window`]), reduces
//! each window to a bounded set of groups ([`topn`]) and writes chart feeds
//! ([`render`]).

pub mod config;
pub mod counters;
pub mod detection;
pub mod error;
pub mod models;
pub mod parser;
pub mod render;
pub mod scan;
pub mod sniff;
pub mod store;
pub mod topn;
pub mod window;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use models::domain::{CounterPair, PersistedRecord};
pub use topn::{reduce, TopNGroup};
