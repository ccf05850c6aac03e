//! Build resolution behind the permission gate.
//!
//! All resolution goes through [`pick_build_to_copy_from`]: project lookup,
//! the read-permission gate, then selector dispatch. An unauthorized source
//! project is indistinguishable from an absent one so that resolution never
//! leaks project existence to unauthorized requesters.

use std::sync::Arc;

use crate::context::PickContext;
use crate::model::{Build, Job, Principal};
use crate::select::BuildSelector;

/// Result of build resolution. Never an error: missing projects and
/// unmatched selectors are ordinary outcomes the caller turns into a step
/// failure or a no-op as its configuration dictates.
#[derive(Clone)]
pub enum PickOutcome {
    /// A build was picked from the (readable) source project.
    Found { job: Arc<Job>, build: Arc<Build> },

    /// The project does not exist, or the requester may not know whether
    /// it exists.
    ProjectNotFound,

    /// The project is readable but no build satisfied the selector and
    /// filter.
    BuildNotFound { job: Arc<Job> },
}

impl std::fmt::Debug for PickOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PickOutcome::Found { job, build } => f
                .debug_struct("Found")
                .field("job", &job.name)
                .field("build", &build.number)
                .finish(),
            PickOutcome::ProjectNotFound => write!(f, "ProjectNotFound"),
            PickOutcome::BuildNotFound { job } => f
                .debug_struct("BuildNotFound")
                .field("job", &job.name)
                .finish(),
        }
    }
}

/// Resolve the source build for a copy request.
pub fn pick_build_to_copy_from(
    selector: &dyn BuildSelector,
    ctx: &PickContext<'_>,
) -> PickOutcome {
    let job = match ctx.host.lookup(&ctx.project_name, ctx.copier_folder()) {
        Some(job) => job,
        None => {
            ctx.log_debug(format!("Project '{}' is not found", ctx.project_name));
            return PickOutcome::ProjectNotFound;
        }
    };

    if !can_read_from(&job, ctx) {
        return PickOutcome::ProjectNotFound;
    }

    match selector.pick_build(&job, ctx) {
        Some(build) => PickOutcome::Found { job, build },
        None => {
            ctx.log_debug(format!(
                "{}: no build of '{}' matched",
                selector.display_name(),
                job.name
            ));
            PickOutcome::BuildNotFound { job }
        }
    }
}

/// The permission gate. Access is granted by an explicit cross-project
/// grant for the requesting job, by the requesting principal's own read
/// permission, or, for requests running as the unscoped system identity,
/// by the source being readable to any authenticated user.
fn can_read_from(source: &Arc<Job>, ctx: &PickContext<'_>) -> bool {
    let requester = &ctx.copier_build.job;
    if ctx.host.grant_allows(&source.name, requester) {
        ctx.log_debug(format!(
            "'{}' grants artifact copies to '{}'",
            source.name, requester
        ));
        return true;
    }

    match &ctx.principal {
        Principal::User(_) => {
            if source.acl.allows(&ctx.principal) {
                return true;
            }
            ctx.log_debug(format!("No permission to read '{}'", source.name));
            false
        }
        // A system-scoped request carries no user identity; fall back to
        // whether any authenticated user could read the source.
        Principal::System => {
            if source.acl.authenticated_read {
                return true;
            }
            ctx.log_debug(format!(
                "'{}' is not readable to authenticated users; configure an \
                 explicit copy grant to allow this",
                source.name
            ));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BufferListener, EnvVars};
    use crate::host::{CopyGrant, Host};
    use crate::model::{Acl, BuildStatus, JobName};
    use crate::select::StatusBuildSelector;
    use chrono::Utc;

    fn completed(job: &str, number: u64) -> Build {
        Build {
            job: JobName::new(job),
            number,
            status: BuildStatus::Success,
            completed_at: Some(Utc::now()),
            ..Build::default()
        }
    }

    fn pick_context<'a>(host: &'a Host, principal: Principal) -> PickContext<'a> {
        PickContext {
            host,
            copier_build: Arc::new(completed("consumer", 1)),
            principal,
            env: EnvVars::new(),
            listener: Arc::new(BufferListener::new()),
            verbose: true,
            project_name: "producer".to_string(),
            filter: None,
        }
    }

    #[test]
    fn test_found_on_open_project() {
        let host = Host::new().with_job(Job::new("producer").with_build(completed("producer", 4)));
        let ctx = pick_context(&host, Principal::User("alice".to_string()));

        let outcome = pick_build_to_copy_from(&StatusBuildSelector::new(true), &ctx);
        match outcome {
            PickOutcome::Found { build, .. } => assert_eq!(build.number, 4),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_project_not_found() {
        let host = Host::new();
        let ctx = pick_context(&host, Principal::User("alice".to_string()));
        let outcome = pick_build_to_copy_from(&StatusBuildSelector::new(true), &ctx);
        assert!(matches!(outcome, PickOutcome::ProjectNotFound));
    }

    #[test]
    fn test_unauthorized_reads_as_project_not_found() {
        let host = Host::new().with_job(
            Job::new("producer")
                .with_acl(Acl::default().with_reader("bob"))
                .with_build(completed("producer", 4)),
        );
        let ctx = pick_context(&host, Principal::User("alice".to_string()));

        // Same outcome as an absent project.
        let outcome = pick_build_to_copy_from(&StatusBuildSelector::new(true), &ctx);
        assert!(matches!(outcome, PickOutcome::ProjectNotFound));
    }

    #[test]
    fn test_grant_overrides_acl() {
        let host = Host::new()
            .with_job(
                Job::new("producer")
                    .with_acl(Acl::default().with_reader("bob"))
                    .with_build(completed("producer", 4)),
            )
            .with_grant(CopyGrant {
                source_job: JobName::new("producer"),
                allowed_jobs: vec![JobName::new("consumer")],
            });
        let ctx = pick_context(&host, Principal::User("alice".to_string()));

        let outcome = pick_build_to_copy_from(&StatusBuildSelector::new(true), &ctx);
        assert!(matches!(outcome, PickOutcome::Found { .. }));
    }

    #[test]
    fn test_system_principal_uses_authenticated_fallback() {
        let restricted = Host::new().with_job(
            Job::new("producer")
                .with_acl(Acl::default().with_reader("bob"))
                .with_build(completed("producer", 4)),
        );
        let ctx = pick_context(&restricted, Principal::System);
        let outcome = pick_build_to_copy_from(&StatusBuildSelector::new(true), &ctx);
        assert!(matches!(outcome, PickOutcome::ProjectNotFound));

        let open = Host::new().with_job(Job::new("producer").with_build(completed("producer", 4)));
        let ctx = pick_context(&open, Principal::System);
        let outcome = pick_build_to_copy_from(&StatusBuildSelector::new(true), &ctx);
        assert!(matches!(outcome, PickOutcome::Found { .. }));
    }

    #[test]
    fn test_readable_project_without_matching_build() {
        let host = Host::new().with_job(Job::new("producer"));
        let ctx = pick_context(&host, Principal::User("alice".to_string()));

        let outcome = pick_build_to_copy_from(&StatusBuildSelector::new(true), &ctx);
        match outcome {
            PickOutcome::BuildNotFound { job } => assert_eq!(job.name.full(), "producer"),
            other => panic!("expected BuildNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_folder_relative_lookup_applies_gate() {
        let host = Host::new().with_job(
            Job::new("team/producer").with_build(completed("team/producer", 2)),
        );
        let mut ctx = pick_context(&host, Principal::User("alice".to_string()));
        ctx.copier_build = Arc::new(completed("team/consumer", 1));

        let outcome = pick_build_to_copy_from(&StatusBuildSelector::new(true), &ctx);
        match outcome {
            PickOutcome::Found { job, .. } => assert_eq!(job.name.full(), "team/producer"),
            other => panic!("expected Found, got {other:?}"),
        }
    }
}
