//! The copy-artifact build step: configuration, validation and execution.
//!
//! [`CopyArtifactStep::perform`] ties the crate together: it expands the
//! configured project name, resolves a source build through the permission
//! gate, runs the transfer, and publishes the selected build number as a
//! result variable for later steps of the requesting build.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::context::{AbortSignal, CopyContext, EnvVars, Listener, PickContext};
use crate::copy::{
    copy_artifacts_from, CopyError, CopyOutcome, FingerprintStore, FingerprintingCopier,
};
use crate::filter::FilterConfig;
use crate::gate::{pick_build_to_copy_from, PickOutcome};
use crate::host::Host;
use crate::model::{Build, BuildRef, Principal, UnknownPermalink};
use crate::scan::{FileSet, ScanError};
use crate::select::SelectorConfig;
use crate::tree::{FsTree, VirtualTree};

/// Prefix of the published result variable.
pub const RESULT_VARIABLE_PREFIX: &str = "COPYARTIFACT_BUILD_NUMBER_";

fn suffix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap())
}

fn non_letter_runs() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Z]+").unwrap())
}

/// Configuration rejected before any resolution is attempted.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("project name must not be blank")]
    BlankProjectName,

    #[error("result variable suffix '{0}' must match [A-Za-z0-9_]+")]
    InvalidSuffix(String),

    #[error(transparent)]
    Pattern(#[from] ScanError),

    #[error(transparent)]
    Selector(#[from] UnknownPermalink),

    #[error("invalid TOML step configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON step configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Step failure. Not-found outcomes become errors only here, and only when
/// the step is not marked optional.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("project '{0}' is not found or not readable")]
    MissingProject(String),

    #[error("no build matching the configured selector in '{0}'")]
    MissingBuild(String),

    #[error("no artifacts of '{job}' matched '{pattern}'")]
    NothingCopied { job: String, pattern: String },

    #[error(transparent)]
    Copy(#[from] CopyError),
}

/// Persisted step configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Job to copy from; supports variable expansion and folder-relative
    /// names.
    pub project_name: String,

    pub selector: SelectorConfig,
    pub filter: Option<FilterConfig>,

    /// Include pattern set; supports variable expansion.
    pub includes: String,

    pub excludes: Option<String>,

    /// Target directory relative to the requesting build's workspace.
    pub target_dir: String,

    pub flatten: bool,

    /// When set, an absent project, build or file set is a no-op instead
    /// of a step failure.
    pub optional: bool,

    pub fingerprint_artifacts: bool,

    /// Result-variable suffix override; the source job's name is used when
    /// unset.
    pub result_var_suffix: Option<String>,

    pub verbose: bool,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            selector: SelectorConfig::default(),
            filter: None,
            includes: "**".to_string(),
            excludes: None,
            target_dir: String::new(),
            flatten: false,
            optional: false,
            fingerprint_artifacts: true,
            result_var_suffix: None,
            verbose: false,
        }
    }
}

impl StepConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reject configurations that can never succeed. Patterns containing
    /// variable references are compiled again after expansion at run time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_name.trim().is_empty() {
            return Err(ConfigError::BlankProjectName);
        }
        if let Some(suffix) = &self.result_var_suffix {
            if !suffix_pattern().is_match(suffix) {
                return Err(ConfigError::InvalidSuffix(suffix.clone()));
            }
        }
        if !self.includes.contains('$') {
            FileSet::new(&self.includes, None)?;
        }
        if let Some(excludes) = &self.excludes {
            if !excludes.contains('$') {
                FileSet::new("**", Some(excludes))?;
            }
        }
        Ok(())
    }
}

/// Everything the host engine supplies for one step invocation.
pub struct StepRequest<'a> {
    pub host: &'a Host,

    /// The requesting build.
    pub build: Arc<Build>,

    /// The requesting build's workspace root.
    pub workspace: PathBuf,

    pub env: EnvVars,
    pub principal: Principal,
    pub listener: Arc<dyn Listener>,
    pub abort: AbortSignal,
    pub fingerprints: Arc<dyn FingerprintStore>,
}

/// Outcome of a successful (or optional no-op) invocation.
#[derive(Debug)]
pub struct StepResult {
    pub outcome: CopyOutcome,

    /// The resolved source build, when one was found.
    pub source: Option<BuildRef>,

    /// Variables to publish into the requesting build's environment.
    pub exported: BTreeMap<String, String>,
}

/// A validated, ready-to-run copy-artifact step.
pub struct CopyArtifactStep {
    config: StepConfig,
    selector: Box<dyn crate::select::BuildSelector>,
    filter: Option<Box<dyn crate::filter::BuildFilter>>,
}

impl CopyArtifactStep {
    pub fn build(config: StepConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let selector = config.selector.clone().into_selector()?;
        let filter = config.filter.clone().map(FilterConfig::into_filter);
        Ok(Self {
            config,
            selector,
            filter,
        })
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub fn perform(&self, request: StepRequest<'_>) -> Result<StepResult, StepError> {
        let project_name = request.env.expand(&self.config.project_name);

        let pick_ctx = PickContext {
            host: request.host,
            copier_build: Arc::clone(&request.build),
            principal: request.principal.clone(),
            env: request.env.clone(),
            listener: Arc::clone(&request.listener),
            verbose: self.config.verbose,
            project_name: project_name.clone(),
            filter: self.filter.as_deref(),
        };

        let (job, source) = match pick_build_to_copy_from(self.selector.as_ref(), &pick_ctx) {
            PickOutcome::Found { job, build } => (job, build),
            PickOutcome::ProjectNotFound => {
                if self.config.optional {
                    pick_ctx.log_info(format!(
                        "Unable to find project '{project_name}'; skipping optional copy"
                    ));
                    return Ok(Self::no_op());
                }
                return Err(StepError::MissingProject(project_name));
            }
            PickOutcome::BuildNotFound { job } => {
                if self.config.optional {
                    pick_ctx.log_info(format!(
                        "Unable to find a build of '{}'; skipping optional copy",
                        job.name
                    ));
                    return Ok(Self::no_op());
                }
                return Err(StepError::MissingBuild(job.name.full().to_string()));
            }
        };

        pick_ctx.log_info(format!("Copying artifacts from {}", source.full_label()));

        let includes = request.env.expand(&self.config.includes);
        let excludes = self
            .config
            .excludes
            .as_deref()
            .map(|e| request.env.expand(e));
        let target_dir = request
            .workspace
            .join(request.env.expand(&self.config.target_dir));

        // The workspace-snapshot selector copies the source job's live
        // workspace rather than the picked build's artifacts.
        let source_override: Option<Arc<dyn VirtualTree>> =
            if self.selector.copies_from_workspace() {
                match &job.workspace {
                    Some(path) => Some(Arc::new(FsTree::new(path))),
                    None => {
                        pick_ctx.log_info(format!("'{}' has no workspace", job.name));
                        Some(crate::tree::MemTree::new().into_tree())
                    }
                }
            } else {
                None
            };

        let copy_ctx = CopyContext {
            host: request.host,
            copier_build: Arc::clone(&request.build),
            env: request.env.clone(),
            listener: Arc::clone(&request.listener),
            verbose: self.config.verbose,
            target_dir,
            includes: includes.clone(),
            excludes,
            flatten: self.config.flatten,
            fingerprint: self.config.fingerprint_artifacts,
            abort: request.abort.clone(),
            fingerprints: Arc::clone(&request.fingerprints),
            source_override,
        };

        let outcome = copy_artifacts_from(&source, &FingerprintingCopier, &copy_ctx)?;
        if !outcome.copied() && !self.config.optional {
            return Err(StepError::NothingCopied {
                job: job.name.full().to_string(),
                pattern: includes,
            });
        }

        let mut exported = BTreeMap::new();
        let suffix = self.result_variable_suffix(&pick_ctx);
        exported.insert(
            format!("{RESULT_VARIABLE_PREFIX}{suffix}"),
            source.number.to_string(),
        );

        Ok(StepResult {
            outcome,
            source: Some(source.build_ref()),
            exported,
        })
    }

    fn no_op() -> StepResult {
        StepResult {
            outcome: CopyOutcome::NoFilesCopied,
            source: None,
            exported: BTreeMap::new(),
        }
    }

    /// The configured suffix when valid; otherwise the source job's name
    /// (relative to the requester's folder, or full when the name was given
    /// as absolute), uppercased with non-letter runs collapsed to
    /// underscores.
    fn result_variable_suffix(&self, ctx: &PickContext<'_>) -> String {
        if let Some(suffix) = &self.config.result_var_suffix {
            if suffix_pattern().is_match(suffix) {
                return suffix.clone();
            }
            ctx.log_info(format!(
                "Ignoring invalid result variable suffix '{suffix}'"
            ));
        }
        let absolute = ctx.project_name.starts_with('/');
        let name = ctx
            .host
            .lookup(&ctx.project_name, ctx.copier_folder())
            .map(|job| {
                if absolute {
                    job.name.full().to_string()
                } else {
                    job.name
                        .relative_to(ctx.copier_folder())
                        .map(str::to_string)
                        .unwrap_or_else(|| job.name.full().to_string())
                }
            })
            .unwrap_or_else(|| ctx.project_name.clone());
        non_letter_runs()
            .replace_all(&name.to_uppercase(), "_")
            .into_owned()
    }
}

/// One-shot migration of a persisted project name of the legacy shape
/// `job/PARAM=value`, run by the host during configuration load.
///
/// When the final path segment contains `=` and no job exists under the
/// undivided name, the name splits into a job expression and a
/// parameter-match filter. Already-migrated names pass through unchanged,
/// so the pass is idempotent.
pub fn migrate_project_name(host: &Host, persisted: &str) -> (String, Option<FilterConfig>) {
    let persisted = persisted.trim();
    if host.job(persisted).is_some() {
        return (persisted.to_string(), None);
    }
    let (prefix, last) = match persisted.rsplit_once('/') {
        Some((prefix, last)) => (prefix, last),
        None => return (persisted.to_string(), None),
    };
    if !last.contains('=') || prefix.is_empty() {
        return (persisted.to_string(), None);
    }
    (
        prefix.to_string(),
        Some(FilterConfig::Parameters {
            parameters: last.to_string(),
        }),
    )
}
