//! Whittle: the search-and-minimization engine behind a property-based
//! testing library.
//!
//! Given a predicate over a byte-stream [`data::DataSource`], the
//! [`runner::Runner`] searches pseudo-random byte streams, classifies each
//! execution, keeps a Pareto front of interesting and valid examples across
//! named objectives, shrinks failures to locally minimal form, and mirrors
//! the front into an external key-value store so diversity survives across
//! runs.

pub mod cache;
pub mod config;
pub mod data;
pub mod database;
pub mod mutator;
pub mod pareto;
pub mod runner;
pub mod shrinker;

pub use cache::ResultCache;
pub use config::{DatabaseSettings, EngineConfig, HealthCheckKind, Phase};
pub use data::{DataSource, InterestingOrigin, Status, StopTest, TestResult};
pub use database::{
    DatabaseError, DirectoryDatabase, ExampleDatabase, InMemoryDatabase, pareto_key,
};
pub use mutator::{
    BufferMutator, DuplicateSpanMutator, NudgeByteMutator, OverwriteSpanMutator, standard_mutators,
};
pub use pareto::{Admission, Dominance, ParetoFront, dominance, sort_key};
pub use runner::{EngineError, RunReport, RunStats, Runner};
pub use shrinker::Shrinker;
