//! Job and build records as seen from the copy engine.
//!
//! Jobs and builds are owned and mutated by the hosting execution engine;
//! this crate only reads them. A build carries its completion status, its
//! causal upstream references and, for composite builds, its child builds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::tree::VirtualTree;

/// Hierarchical job name ("folder/subfolder/job").
///
/// Stored without leading or trailing slashes. The empty name is the root
/// folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobName(String);

impl JobName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim_matches('/').to_string())
    }

    /// The full hierarchical name.
    pub fn full(&self) -> &str {
        &self.0
    }

    /// The last segment of the name.
    pub fn simple(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// The containing folder ("" for top-level jobs).
    pub fn folder(&self) -> &str {
        match self.0.rfind('/') {
            Some(i) => &self.0[..i],
            None => "",
        }
    }

    /// The name relative to `folder`, or `None` when this job does not live
    /// under that folder.
    pub fn relative_to(&self, folder: &str) -> Option<&str> {
        if folder.is_empty() {
            return Some(&self.0);
        }
        self.0
            .strip_prefix(folder)
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
    /// Still running; artifacts are not published yet.
    InProgress,
}

impl BuildStatus {
    /// Whether the build has finished running.
    pub fn is_complete(self) -> bool {
        !matches!(self, BuildStatus::InProgress)
    }
}

impl Default for BuildStatus {
    fn default() -> Self {
        BuildStatus::InProgress
    }
}

/// Named permalink classes over a job's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permalink {
    LastBuild,
    LastCompletedBuild,
    LastSuccessfulBuild,
    LastStableBuild,
    LastFailedBuild,
    LastSavedBuild,
}

impl Permalink {
    /// Whether `build` belongs to this permalink's semantic class.
    pub fn admits(self, build: &Build) -> bool {
        if !build.status.is_complete() {
            return false;
        }
        match self {
            Permalink::LastBuild | Permalink::LastCompletedBuild => true,
            Permalink::LastSuccessfulBuild => {
                matches!(build.status, BuildStatus::Success | BuildStatus::Unstable)
            }
            Permalink::LastStableBuild => matches!(build.status, BuildStatus::Success),
            Permalink::LastFailedBuild => matches!(build.status, BuildStatus::Failure),
            Permalink::LastSavedBuild => build.kept,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permalink::LastBuild => "lastBuild",
            Permalink::LastCompletedBuild => "lastCompletedBuild",
            Permalink::LastSuccessfulBuild => "lastSuccessfulBuild",
            Permalink::LastStableBuild => "lastStableBuild",
            Permalink::LastFailedBuild => "lastFailedBuild",
            Permalink::LastSavedBuild => "lastSavedBuild",
        }
    }
}

impl std::fmt::Display for Permalink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error raised for an unrecognized permalink keyword.
#[derive(Debug, thiserror::Error)]
#[error("unknown permalink keyword: {0}")]
pub struct UnknownPermalink(pub String);

impl std::str::FromStr for Permalink {
    type Err = UnknownPermalink;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lastBuild" => Ok(Permalink::LastBuild),
            "lastCompletedBuild" => Ok(Permalink::LastCompletedBuild),
            "lastSuccessfulBuild" => Ok(Permalink::LastSuccessfulBuild),
            "lastStableBuild" => Ok(Permalink::LastStableBuild),
            "lastFailedBuild" => Ok(Permalink::LastFailedBuild),
            "lastSavedBuild" => Ok(Permalink::LastSavedBuild),
            other => Err(UnknownPermalink(other.to_string())),
        }
    }
}

/// Reference to one build of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRef {
    pub job: JobName,
    pub number: u64,
}

impl std::fmt::Display for BuildRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} #{}", self.job, self.number)
    }
}

/// One realized child of a multi-configuration build.
#[derive(Clone)]
pub struct MatrixRun {
    /// Configuration name, e.g. "os=linux".
    pub configuration: String,
    pub build: Arc<Build>,
}

/// Structural classification of a build.
#[derive(Clone, Default)]
pub enum BuildKind {
    /// An ordinary build with no sub-builds.
    #[default]
    Leaf,
    /// A multi-configuration build fanning out over realized configurations.
    Matrix(Vec<MatrixRun>),
    /// A multi-module aggregate; children are the most recent per-module
    /// builds.
    ModuleAggregate(Vec<Arc<Build>>),
}

/// One execution record of a job.
#[derive(Clone, Default)]
pub struct Build {
    /// Owning job's full name.
    pub job: JobName,

    /// Monotonically increasing, unique within the job.
    pub number: u64,

    /// Optional human-assigned display name.
    pub display_name: Option<String>,

    /// Optional persistent identifier.
    pub id: Option<String>,

    pub status: BuildStatus,

    /// Completion time; unset while in progress.
    pub completed_at: Option<DateTime<Utc>>,

    /// Marked for indefinite retention.
    pub kept: bool,

    /// Build parameter values.
    pub parameters: BTreeMap<String, String>,

    /// Builds that caused this one to run.
    pub upstream: Vec<BuildRef>,

    pub kind: BuildKind,

    /// Published artifact root. `None` means "no artifacts", which is a
    /// valid non-error state.
    pub artifacts: Option<Arc<dyn VirtualTree>>,
}

impl Build {
    /// Reference to this build.
    pub fn build_ref(&self) -> BuildRef {
        BuildRef {
            job: self.job.clone(),
            number: self.number,
        }
    }

    /// Display form used in log lines: the display name when assigned,
    /// otherwise "#<number>".
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => format!("#{}", self.number),
        }
    }

    /// Full display form including the owning job.
    pub fn full_label(&self) -> String {
        format!("{} {}", self.job, self.label())
    }
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("job", &self.job)
            .field("number", &self.number)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Read access control for a job.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    /// Principals granted read access by name.
    pub readers: BTreeSet<String>,

    /// Whether any authenticated user may read.
    pub authenticated_read: bool,
}

impl Acl {
    /// Open to every authenticated user.
    pub fn open() -> Self {
        Self {
            readers: BTreeSet::new(),
            authenticated_read: true,
        }
    }

    pub fn with_reader(mut self, name: impl Into<String>) -> Self {
        self.readers.insert(name.into());
        self
    }

    /// Whether `principal` holds read permission under this ACL. The system
    /// principal bypasses ACLs; the resolution gate applies its own
    /// fallback instead of relying on this.
    pub fn allows(&self, principal: &Principal) -> bool {
        match principal {
            Principal::System => true,
            Principal::User(name) => self.authenticated_read || self.readers.contains(name),
        }
    }
}

/// The identity a build executes under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Unscoped system identity (no per-user authorization configured).
    System,
    /// An authenticated user.
    User(String),
}

/// A named unit owning an ordered build history.
pub struct Job {
    pub name: JobName,

    /// Build history; callers should not rely on its order and use
    /// [`Job::builds_desc`] instead.
    pub builds: Vec<Arc<Build>>,

    pub acl: Acl,

    /// Live on-disk workspace, for execution models that keep one per job.
    pub workspace: Option<PathBuf>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: JobName::new(name),
            builds: Vec::new(),
            acl: Acl::open(),
            workspace: None,
        }
    }

    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_build(mut self, build: Build) -> Self {
        self.builds.push(Arc::new(build));
        self
    }

    pub fn with_workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace = Some(path.into());
        self
    }

    /// History from most recent to oldest. Higher build number wins; among
    /// equal numbers, later completion time wins.
    pub fn builds_desc(&self) -> Vec<Arc<Build>> {
        let mut builds = self.builds.clone();
        builds.sort_by(|a, b| {
            b.number
                .cmp(&a.number)
                .then(b.completed_at.cmp(&a.completed_at))
        });
        builds
    }

    pub fn build_by_number(&self, number: u64) -> Option<Arc<Build>> {
        self.builds.iter().find(|b| b.number == number).cloned()
    }

    pub fn build_by_id(&self, id: &str) -> Option<Arc<Build>> {
        self.builds
            .iter()
            .find(|b| b.id.as_deref() == Some(id))
            .cloned()
    }

    pub fn build_by_display_name(&self, name: &str) -> Option<Arc<Build>> {
        self.builds_desc()
            .into_iter()
            .find(|b| b.display_name.as_deref() == Some(name))
    }

    /// The newest build in the permalink's semantic class.
    pub fn permalink_target(&self, permalink: Permalink) -> Option<Arc<Build>> {
        self.builds_desc()
            .into_iter()
            .find(|b| permalink.admits(b))
    }
}
