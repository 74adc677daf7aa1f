//! script-bisect core library
//!
//! Finds the commit of a Python dependency that changed a script's behaviour
//! by rewriting the script's inline dependency metadata to pin the
//! dependency to successive commits and running it.

pub mod engine;
pub mod error;
pub mod fixer;
pub mod git;
pub mod metadata;
pub mod obs;
pub mod oracle;
pub mod report;
pub mod runner;
pub mod specifier;
pub mod telemetry;
pub mod workspace;

/// Crate version, recorded in run reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use engine::{BisectOutcome, BisectionEngine, EngineConfig};
pub use error::{BisectError, Endpoint, Result};
pub use fixer::{FixCatalog, FixDirective, FixOutcome};
pub use git::{
    looks_like_newer_version, CommitRangeResolver, CommitRef, CommitSequence, GitRepository,
    Repository, ResolvedRange,
};
pub use metadata::{DependencyBlock, ScriptMetadata};
pub use oracle::{Oracle, OracleConfig, ProbeOutcome, ProbeReport, TestOracle, Verdict};
pub use report::{BisectReport, RunParameters};
pub use runner::{ProcessOutput, ProcessRunner, RunnerError, SubprocessRunner, TestCommand};
pub use specifier::DependencySpec;
pub use workspace::ManagedScript;
