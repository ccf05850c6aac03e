//! Artifact Relay - cross-job artifact copying for a build-execution host
//!
//! This crate implements the copy-artifact build step: it resolves a
//! source build of another job through a permission gate, selects it by
//! status, permalink, trigger cause, parameters or an explicit reference,
//! and transfers the matching artifact files into the requesting build's
//! workspace, recording content fingerprints for provenance.

pub mod context;
pub mod copy;
pub mod filter;
pub mod gate;
pub mod host;
pub mod model;
pub mod scan;
pub mod select;
pub mod step;
pub mod tree;

pub use context::{AbortSignal, BufferListener, ConsoleListener, EnvVars, Listener};
pub use copy::{CopyError, CopyOutcome, Copier, FingerprintStore, InMemoryFingerprintStore};
pub use filter::{BuildFilter, FilterConfig};
pub use gate::{pick_build_to_copy_from, PickOutcome};
pub use host::{CopyGrant, Host};
pub use model::{Acl, Build, BuildRef, BuildStatus, Job, JobName, Permalink, Principal};
pub use select::{BuildSelector, SelectorConfig};
pub use step::{
    migrate_project_name, ConfigError, CopyArtifactStep, StepConfig, StepError, StepRequest,
    StepResult,
};
