//! Build filters: pure predicates refining what a selector may pick.
//!
//! Rejections are expected, frequent outcomes and are only distinguished
//! from misconfiguration through the context log. A filter never errors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::PickContext;
use crate::model::Build;

/// Predicate over candidate builds. Read-only; may log at debug level why
/// a candidate was rejected.
pub trait BuildFilter: Send + Sync {
    fn display_name(&self) -> &'static str;

    fn accepts(&self, candidate: &Arc<Build>, ctx: &PickContext<'_>) -> bool;
}

/// Accepts a candidate iff it is causally downstream of a specific build
/// of a named upstream job.
///
/// Both fields support variable expansion. A blank expansion, an
/// unreadable upstream job, or the absence of any downstream relationship
/// all reject the candidate.
pub struct DownstreamBuildFilter {
    upstream_project: String,
    upstream_build: String,
}

impl DownstreamBuildFilter {
    pub fn new(upstream_project: impl Into<String>, upstream_build: impl Into<String>) -> Self {
        Self {
            upstream_project: upstream_project.into().trim().to_string(),
            upstream_build: upstream_build.into().trim().to_string(),
        }
    }
}

impl BuildFilter for DownstreamBuildFilter {
    fn display_name(&self) -> &'static str {
        "downstream build filter"
    }

    fn accepts(&self, candidate: &Arc<Build>, ctx: &PickContext<'_>) -> bool {
        let project_name = ctx.env.expand(&self.upstream_project);
        let build_expr = ctx.env.expand(&self.upstream_build);

        if project_name.trim().is_empty() {
            ctx.log_info(format!(
                "{}: upstream project name expands to empty",
                self.display_name()
            ));
            return false;
        }
        if build_expr.trim().is_empty() {
            ctx.log_info(format!(
                "{}: upstream build number expands to empty",
                self.display_name()
            ));
            return false;
        }

        let upstream_job = match ctx.host.lookup(&project_name, ctx.copier_folder()) {
            Some(job) if job.acl.allows(&ctx.principal) => job,
            _ => {
                ctx.log_info(format!(
                    "{}: upstream project '{}' is not found",
                    self.display_name(),
                    project_name
                ));
                return false;
            }
        };

        let upstream_build = match ctx.host.upstream_build(candidate, &upstream_job) {
            Some(build) => build,
            None => {
                ctx.log_debug(format!(
                    "{}: no upstream build of '{}' found for {}",
                    self.display_name(),
                    upstream_job.name,
                    candidate.full_label()
                ));
                return false;
            }
        };

        if let Ok(number) = build_expr.trim().parse::<u64>() {
            if number == upstream_build.number {
                return true;
            }
        }
        if upstream_build.id.as_deref() == Some(build_expr.trim())
            || upstream_build.display_name.as_deref() == Some(build_expr.trim())
        {
            return true;
        }

        ctx.log_debug(format!(
            "{}: {} is downstream of {}, not of '{}'",
            self.display_name(),
            candidate.full_label(),
            upstream_build.full_label(),
            build_expr
        ));
        false
    }
}

/// Accepts a candidate whose parameter values match a configured
/// `NAME=value,NAME2=value2` set (after variable expansion).
pub struct ParametersBuildFilter {
    parameters: String,
}

impl ParametersBuildFilter {
    pub fn new(parameters: impl Into<String>) -> Self {
        Self {
            parameters: parameters.into(),
        }
    }

    fn pairs(raw: &str) -> Vec<(String, String)> {
        raw.split(',')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

impl BuildFilter for ParametersBuildFilter {
    fn display_name(&self) -> &'static str {
        "parameters build filter"
    }

    fn accepts(&self, candidate: &Arc<Build>, ctx: &PickContext<'_>) -> bool {
        let expanded = ctx.env.expand(&self.parameters);
        let pairs = Self::pairs(&expanded);
        if pairs.is_empty() {
            ctx.log_info(format!(
                "{}: no name=value pairs in '{}'",
                self.display_name(),
                expanded
            ));
            return false;
        }

        for (name, value) in &pairs {
            if candidate.parameters.get(name) != Some(value) {
                ctx.log_debug(format!(
                    "{}: {} does not match {}={}",
                    self.display_name(),
                    candidate.full_label(),
                    name,
                    value
                ));
                return false;
            }
        }
        true
    }
}

/// Accepts only candidates every inner filter accepts.
pub struct AllOfFilter {
    filters: Vec<Box<dyn BuildFilter>>,
}

impl AllOfFilter {
    pub fn new(filters: Vec<Box<dyn BuildFilter>>) -> Self {
        Self { filters }
    }
}

impl BuildFilter for AllOfFilter {
    fn display_name(&self) -> &'static str {
        "all-of filter"
    }

    fn accepts(&self, candidate: &Arc<Build>, ctx: &PickContext<'_>) -> bool {
        self.filters.iter().all(|f| f.accepts(candidate, ctx))
    }
}

/// Persistable filter configuration. The variant set is resolved here, at
/// configuration-parse time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterConfig {
    Downstream {
        upstream_project: String,
        upstream_build: String,
    },
    Parameters {
        parameters: String,
    },
    AllOf {
        filters: Vec<FilterConfig>,
    },
}

impl FilterConfig {
    pub fn into_filter(self) -> Box<dyn BuildFilter> {
        match self {
            FilterConfig::Downstream {
                upstream_project,
                upstream_build,
            } => Box::new(DownstreamBuildFilter::new(upstream_project, upstream_build)),
            FilterConfig::Parameters { parameters } => {
                Box::new(ParametersBuildFilter::new(parameters))
            }
            FilterConfig::AllOf { filters } => Box::new(AllOfFilter::new(
                filters.into_iter().map(FilterConfig::into_filter).collect(),
            )),
        }
    }
}
