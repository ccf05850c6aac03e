//! Build selectors: strategies resolving one build from a job's history.
//!
//! Every selector is side-effect-free with respect to job and build state
//! and must skip any candidate the attached filter rejects. Wherever "most
//! recent" is ambiguous the higher build number wins, then the later
//! completion time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::PickContext;
use crate::model::{Build, BuildStatus, Job, Permalink, UnknownPermalink};

/// Strategy picking at most one build to copy from.
pub trait BuildSelector: Send + Sync {
    fn display_name(&self) -> &'static str;

    fn pick_build(&self, job: &Job, ctx: &PickContext<'_>) -> Option<Arc<Build>>;

    /// Whether the copy reads the job's live workspace instead of the
    /// picked build's artifact root.
    fn copies_from_workspace(&self) -> bool {
        false
    }
}

/// Picks the most recent completed build at or above a status threshold.
pub struct StatusBuildSelector {
    /// Accept only stable (successful) builds; otherwise unstable builds
    /// qualify too.
    stable_only: bool,
}

impl StatusBuildSelector {
    pub fn new(stable_only: bool) -> Self {
        Self { stable_only }
    }

    fn qualifies(&self, status: BuildStatus) -> bool {
        match status {
            BuildStatus::Success => true,
            BuildStatus::Unstable => !self.stable_only,
            _ => false,
        }
    }
}

impl BuildSelector for StatusBuildSelector {
    fn display_name(&self) -> &'static str {
        "status build selector"
    }

    fn pick_build(&self, job: &Job, ctx: &PickContext<'_>) -> Option<Arc<Build>> {
        job.builds_desc().into_iter().find(|build| {
            if !build.status.is_complete() || !self.qualifies(build.status) {
                return false;
            }
            if !ctx.filter_accepts(build) {
                ctx.log_debug(format!(
                    "{}: {} rejected by filter",
                    self.display_name(),
                    build.label()
                ));
                return false;
            }
            true
        })
    }
}

/// Picks the newest build in a permalink's semantic class.
///
/// When the filter rejects the permalink's nominal target, history is
/// scanned for the nearest build satisfying both the class and the filter.
pub struct PermalinkBuildSelector {
    permalink: Permalink,
}

impl PermalinkBuildSelector {
    pub fn new(permalink: Permalink) -> Self {
        Self { permalink }
    }
}

impl BuildSelector for PermalinkBuildSelector {
    fn display_name(&self) -> &'static str {
        "permalink build selector"
    }

    fn pick_build(&self, job: &Job, ctx: &PickContext<'_>) -> Option<Arc<Build>> {
        let nominal = job.permalink_target(self.permalink);
        let picked = job
            .builds_desc()
            .into_iter()
            .find(|build| self.permalink.admits(build) && ctx.filter_accepts(build));

        if let (Some(nominal), Some(picked)) = (&nominal, &picked) {
            if nominal.number != picked.number {
                ctx.log_debug(format!(
                    "{}: {} target {} rejected by filter, fell back to {}",
                    self.display_name(),
                    self.permalink,
                    nominal.label(),
                    picked.label()
                ));
            }
        }
        picked
    }
}

/// Resolves a build-number expression: a literal number, a persistent id,
/// an assigned display name, or a permalink keyword. The first successful
/// interpretation wins.
pub struct SpecificBuildSelector {
    build_expr: String,
}

impl SpecificBuildSelector {
    pub fn new(build_expr: impl Into<String>) -> Self {
        Self {
            build_expr: build_expr.into(),
        }
    }

    fn resolve(&self, expr: &str, job: &Job, ctx: &PickContext<'_>) -> Option<Arc<Build>> {
        if let Ok(number) = expr.parse::<u64>() {
            if let Some(build) = job.build_by_number(number) {
                return Some(build);
            }
        }
        if let Some(build) = job.build_by_id(expr) {
            return Some(build);
        }
        if let Some(build) = job.build_by_display_name(expr) {
            return Some(build);
        }
        if let Ok(permalink) = expr.parse::<Permalink>() {
            return job.permalink_target(permalink);
        }
        ctx.log_debug(format!(
            "{}: no build matches '{}' in {}",
            self.display_name(),
            expr,
            job.name
        ));
        None
    }
}

impl BuildSelector for SpecificBuildSelector {
    fn display_name(&self) -> &'static str {
        "specific build selector"
    }

    fn pick_build(&self, job: &Job, ctx: &PickContext<'_>) -> Option<Arc<Build>> {
        let expr = ctx.env.expand(&self.build_expr);
        let expr = expr.trim();
        if expr.is_empty() {
            return None;
        }
        let build = self.resolve(expr, job, ctx)?;
        if !ctx.filter_accepts(&build) {
            ctx.log_debug(format!(
                "{}: {} rejected by filter",
                self.display_name(),
                build.label()
            ));
            return None;
        }
        Some(build)
    }
}

/// Picks the most recent completed build whose parameter values equal a
/// configured `NAME=value,NAME2=value2` set.
pub struct ParameterizedBuildSelector {
    parameters: String,
}

impl ParameterizedBuildSelector {
    pub fn new(parameters: impl Into<String>) -> Self {
        Self {
            parameters: parameters.into(),
        }
    }
}

impl BuildSelector for ParameterizedBuildSelector {
    fn display_name(&self) -> &'static str {
        "parameterized build selector"
    }

    fn pick_build(&self, job: &Job, ctx: &PickContext<'_>) -> Option<Arc<Build>> {
        let expanded = ctx.env.expand(&self.parameters);
        let pairs: Vec<(&str, &str)> = expanded
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(n, v)| (n.trim(), v.trim()))
            .filter(|(n, _)| !n.is_empty())
            .collect();
        if pairs.is_empty() {
            ctx.log_info(format!(
                "{}: no name=value pairs in '{}'",
                self.display_name(),
                expanded
            ));
            return None;
        }

        job.builds_desc().into_iter().find(|build| {
            build.status.is_complete()
                && pairs
                    .iter()
                    .all(|(name, value)| build.parameters.get(*name).map(String::as_str) == Some(*value))
                && ctx.filter_accepts(build)
        })
    }
}

/// Picks the build of the target job that triggered the requesting build,
/// following the trigger chain transitively.
pub struct TriggeredBuildSelector;

impl BuildSelector for TriggeredBuildSelector {
    fn display_name(&self) -> &'static str {
        "triggered build selector"
    }

    fn pick_build(&self, job: &Job, ctx: &PickContext<'_>) -> Option<Arc<Build>> {
        let build = ctx.host.upstream_build(&ctx.copier_build, job)?;
        if !ctx.filter_accepts(&build) {
            ctx.log_debug(format!(
                "{}: triggering build {} rejected by filter",
                self.display_name(),
                build.label()
            ));
            return None;
        }
        Some(build)
    }
}

/// Picks the most recent build marked for indefinite retention.
pub struct SavedBuildSelector;

impl BuildSelector for SavedBuildSelector {
    fn display_name(&self) -> &'static str {
        "saved build selector"
    }

    fn pick_build(&self, job: &Job, ctx: &PickContext<'_>) -> Option<Arc<Build>> {
        job.builds_desc()
            .into_iter()
            .find(|build| build.kept && build.status.is_complete() && ctx.filter_accepts(build))
    }
}

/// Bypasses build history, copying from the job's live workspace. Only
/// meaningful for execution models with a persistent per-job workspace.
pub struct WorkspaceSelector;

impl BuildSelector for WorkspaceSelector {
    fn display_name(&self) -> &'static str {
        "workspace selector"
    }

    fn pick_build(&self, job: &Job, ctx: &PickContext<'_>) -> Option<Arc<Build>> {
        // The most recent build stands in for provenance reporting; the
        // transfer itself reads the workspace tree.
        let build = job.builds_desc().into_iter().next()?;
        if !ctx.filter_accepts(&build) {
            return None;
        }
        Some(build)
    }

    fn copies_from_workspace(&self) -> bool {
        true
    }
}

/// Persistable selector configuration. The variant set is resolved here,
/// at configuration-parse time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectorConfig {
    Status {
        #[serde(default)]
        stable_only: bool,
    },
    Permalink {
        id: String,
    },
    Specific {
        build: String,
    },
    Parameterized {
        parameters: String,
    },
    Triggered,
    Saved,
    Workspace,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig::Status { stable_only: true }
    }
}

impl SelectorConfig {
    pub fn into_selector(self) -> Result<Box<dyn BuildSelector>, UnknownPermalink> {
        Ok(match self {
            SelectorConfig::Status { stable_only } => Box::new(StatusBuildSelector::new(stable_only)),
            SelectorConfig::Permalink { id } => {
                Box::new(PermalinkBuildSelector::new(id.parse()?))
            }
            SelectorConfig::Specific { build } => Box::new(SpecificBuildSelector::new(build)),
            SelectorConfig::Parameterized { parameters } => {
                Box::new(ParameterizedBuildSelector::new(parameters))
            }
            SelectorConfig::Triggered => Box::new(TriggeredBuildSelector),
            SelectorConfig::Saved => Box::new(SavedBuildSelector),
            SelectorConfig::Workspace => Box::new(WorkspaceSelector),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BufferListener, EnvVars};
    use crate::filter::{BuildFilter, ParametersBuildFilter};
    use crate::host::Host;
    use crate::model::{BuildRef, JobName, Principal};
    use chrono::Utc;

    fn build(number: u64, status: BuildStatus) -> Build {
        Build {
            job: JobName::new("upstream"),
            number,
            status,
            completed_at: status.is_complete().then(Utc::now),
            ..Build::default()
        }
    }

    fn pick_context<'a>(host: &'a Host, filter: Option<&'a dyn BuildFilter>) -> PickContext<'a> {
        PickContext {
            host,
            copier_build: Arc::new(build(1, BuildStatus::InProgress)),
            principal: Principal::System,
            env: EnvVars::new(),
            listener: Arc::new(BufferListener::new()),
            verbose: true,
            project_name: "upstream".to_string(),
            filter,
        }
    }

    #[test]
    fn test_status_selector_stable_only() {
        let job = Job::new("upstream")
            .with_build(build(1, BuildStatus::Success))
            .with_build(build(2, BuildStatus::Unstable))
            .with_build(build(3, BuildStatus::Failure));
        let host = Host::new();
        let ctx = pick_context(&host, None);

        let stable = StatusBuildSelector::new(true).pick_build(&job, &ctx).unwrap();
        assert_eq!(stable.number, 1);

        let successful = StatusBuildSelector::new(false).pick_build(&job, &ctx).unwrap();
        assert_eq!(successful.number, 2);
    }

    #[test]
    fn test_status_selector_skips_incomplete() {
        let job = Job::new("upstream")
            .with_build(build(1, BuildStatus::Success))
            .with_build(build(2, BuildStatus::InProgress));
        let host = Host::new();
        let ctx = pick_context(&host, None);

        let picked = StatusBuildSelector::new(true).pick_build(&job, &ctx).unwrap();
        assert_eq!(picked.number, 1);
    }

    #[test]
    fn test_status_selector_empty_history() {
        let job = Job::new("upstream");
        let host = Host::new();
        let ctx = pick_context(&host, None);
        assert!(StatusBuildSelector::new(false).pick_build(&job, &ctx).is_none());
    }

    #[test]
    fn test_selector_never_returns_filtered_build() {
        let mut tagged = build(3, BuildStatus::Success);
        tagged.parameters.insert("KEEP".to_string(), "yes".to_string());
        let job = Job::new("upstream")
            .with_build(build(1, BuildStatus::Success))
            .with_build(tagged)
            .with_build(build(4, BuildStatus::Success));

        let filter = ParametersBuildFilter::new("KEEP=yes");
        let host = Host::new();
        let ctx = pick_context(&host, Some(&filter));

        let picked = StatusBuildSelector::new(true).pick_build(&job, &ctx).unwrap();
        assert_eq!(picked.number, 3);
    }

    #[test]
    fn test_permalink_selector_falls_back_past_filtered_target() {
        let mut tagged = build(2, BuildStatus::Success);
        tagged.parameters.insert("KEEP".to_string(), "yes".to_string());
        let job = Job::new("upstream")
            .with_build(tagged)
            .with_build(build(5, BuildStatus::Success));

        let filter = ParametersBuildFilter::new("KEEP=yes");
        let host = Host::new();
        let ctx = pick_context(&host, Some(&filter));

        let picked = PermalinkBuildSelector::new(Permalink::LastStableBuild)
            .pick_build(&job, &ctx)
            .unwrap();
        assert_eq!(picked.number, 2);
    }

    #[test]
    fn test_specific_selector_display_name_wins_over_recency() {
        let mut rc = build(2, BuildStatus::Success);
        rc.display_name = Some("RC1".to_string());
        let job = Job::new("upstream")
            .with_build(rc)
            .with_build(build(9, BuildStatus::Success));

        let host = Host::new();
        let ctx = pick_context(&host, None);

        let picked = SpecificBuildSelector::new("RC1").pick_build(&job, &ctx).unwrap();
        assert_eq!(picked.number, 2);

        assert!(SpecificBuildSelector::new("RC2").pick_build(&job, &ctx).is_none());
    }

    #[test]
    fn test_specific_selector_number_then_id_then_permalink() {
        let mut named = build(3, BuildStatus::Success);
        named.id = Some("release-id".to_string());
        let job = Job::new("upstream")
            .with_build(build(2, BuildStatus::Success))
            .with_build(named);

        let host = Host::new();
        let ctx = pick_context(&host, None);

        let by_number = SpecificBuildSelector::new("2").pick_build(&job, &ctx).unwrap();
        assert_eq!(by_number.number, 2);

        let by_id = SpecificBuildSelector::new("release-id")
            .pick_build(&job, &ctx)
            .unwrap();
        assert_eq!(by_id.number, 3);

        let by_permalink = SpecificBuildSelector::new("lastStableBuild")
            .pick_build(&job, &ctx)
            .unwrap();
        assert_eq!(by_permalink.number, 3);
    }

    #[test]
    fn test_specific_selector_expands_variables() {
        let job = Job::new("upstream").with_build(build(4, BuildStatus::Success));
        let host = Host::new();
        let mut ctx = pick_context(&host, None);
        ctx.env = EnvVars::new().with("NUM", "4");

        let picked = SpecificBuildSelector::new("${NUM}").pick_build(&job, &ctx).unwrap();
        assert_eq!(picked.number, 4);
    }

    #[test]
    fn test_parameterized_selector_most_recent_match() {
        let mut old = build(1, BuildStatus::Success);
        old.parameters.insert("ARCH".to_string(), "arm64".to_string());
        let mut new = build(2, BuildStatus::Success);
        new.parameters.insert("ARCH".to_string(), "arm64".to_string());
        let mut other = build(3, BuildStatus::Success);
        other.parameters.insert("ARCH".to_string(), "x86_64".to_string());

        let job = Job::new("upstream")
            .with_build(old)
            .with_build(new)
            .with_build(other);
        let host = Host::new();
        let ctx = pick_context(&host, None);

        let picked = ParameterizedBuildSelector::new("ARCH=arm64")
            .pick_build(&job, &ctx)
            .unwrap();
        assert_eq!(picked.number, 2);
    }

    #[test]
    fn test_triggered_selector_follows_cause() {
        let host = Host::new().with_job(
            Job::new("upstream").with_build(build(7, BuildStatus::Success)),
        );
        let job = host.job("upstream").unwrap();

        let mut ctx = pick_context(&host, None);
        ctx.copier_build = Arc::new(Build {
            job: JobName::new("down"),
            number: 1,
            upstream: vec![BuildRef {
                job: JobName::new("upstream"),
                number: 7,
            }],
            ..Build::default()
        });

        let picked = TriggeredBuildSelector.pick_build(&job, &ctx).unwrap();
        assert_eq!(picked.number, 7);
    }

    #[test]
    fn test_triggered_selector_no_causal_edge() {
        let host = Host::new().with_job(
            Job::new("upstream").with_build(build(7, BuildStatus::Success)),
        );
        let job = host.job("upstream").unwrap();
        let ctx = pick_context(&host, None);
        assert!(TriggeredBuildSelector.pick_build(&job, &ctx).is_none());
    }

    #[test]
    fn test_saved_selector_picks_kept_build() {
        let mut kept = build(2, BuildStatus::Success);
        kept.kept = true;
        let job = Job::new("upstream")
            .with_build(kept)
            .with_build(build(5, BuildStatus::Success));
        let host = Host::new();
        let ctx = pick_context(&host, None);

        let picked = SavedBuildSelector.pick_build(&job, &ctx).unwrap();
        assert_eq!(picked.number, 2);
    }

    #[test]
    fn test_workspace_selector_flags_workspace_copy() {
        assert!(WorkspaceSelector.copies_from_workspace());
        assert!(!StatusBuildSelector::new(true).copies_from_workspace());
    }

    #[test]
    fn test_selector_config_default_and_round_trip() {
        assert_eq!(
            SelectorConfig::default(),
            SelectorConfig::Status { stable_only: true }
        );

        let config = SelectorConfig::Permalink {
            id: "lastSuccessfulBuild".to_string(),
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SelectorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert!(parsed.into_selector().is_ok());

        let bad = SelectorConfig::Permalink {
            id: "lastGreenBuild".to_string(),
        };
        assert!(bad.into_selector().is_err());
    }
}
