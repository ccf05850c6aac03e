//! In-memory facade of the hosting job-execution engine.
//!
//! The engine owns jobs, builds, the upstream/downstream build graph and
//! the cross-project copy grants configured by administrators. This crate
//! consumes it read-only through [`Host`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{Build, BuildRef, Job, JobName};

/// Administrator-configured grant letting specific jobs copy artifacts from
/// a source job regardless of the requesting principal's permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyGrant {
    /// Full name of the job whose artifacts may be copied.
    pub source_job: JobName,

    /// Full names of jobs allowed to copy from it.
    pub allowed_jobs: Vec<JobName>,
}

/// Registry of jobs plus the host-level relations the engine maintains.
#[derive(Default)]
pub struct Host {
    jobs: BTreeMap<String, Arc<Job>>,
    grants: Vec<CopyGrant>,
}

impl Host {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.insert(job.name.full().to_string(), Arc::new(job));
        self
    }

    pub fn with_grant(mut self, grant: CopyGrant) -> Self {
        self.grants.push(grant);
        self
    }

    pub fn job(&self, full_name: &str) -> Option<Arc<Job>> {
        self.jobs.get(full_name.trim_matches('/')).cloned()
    }

    /// Look up a job by a possibly folder-relative name.
    ///
    /// A leading `/` forces an absolute lookup. Otherwise the name is tried
    /// relative to `folder` first, then as a top-level name, so jobs in the
    /// requester's own folder shadow equally named top-level jobs.
    pub fn lookup(&self, name: &str, folder: &str) -> Option<Arc<Job>> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(absolute) = name.strip_prefix('/') {
            return self.job(absolute);
        }
        if !folder.is_empty() {
            if let Some(job) = self.job(&format!("{folder}/{name}")) {
                return Some(job);
            }
        }
        self.job(name)
    }

    /// Whether an explicit grant allows `requester` to copy from `source`.
    pub fn grant_allows(&self, source: &JobName, requester: &JobName) -> bool {
        self.grants
            .iter()
            .filter(|g| &g.source_job == source)
            .any(|g| g.allowed_jobs.contains(requester))
    }

    /// Resolve a build reference against the registry.
    pub fn build_of(&self, build_ref: &BuildRef) -> Option<Arc<Build>> {
        self.job(build_ref.job.full())?
            .build_by_number(build_ref.number)
    }

    /// The build of `upstream_job` that `build` is causally downstream of,
    /// following trigger edges transitively. The nearest cause wins when
    /// several chains reach the job.
    pub fn upstream_build(&self, build: &Build, upstream_job: &Job) -> Option<Arc<Build>> {
        let mut queue: VecDeque<BuildRef> = build.upstream.iter().cloned().collect();
        let mut seen: Vec<BuildRef> = Vec::new();

        while let Some(cause) = queue.pop_front() {
            if seen.contains(&cause) {
                continue;
            }
            seen.push(cause.clone());

            if cause.job == upstream_job.name {
                return upstream_job.build_by_number(cause.number);
            }
            if let Some(intermediate) = self.build_of(&cause) {
                queue.extend(intermediate.upstream.iter().cloned());
            }
        }
        None
    }
}
