//! Request-scoped contexts for resolution and transfer.
//!
//! A context is created per build-step invocation and discarded with it.
//! [`CopyContext`] is cloned per recursive branch so each branch carries
//! its own target-directory override without touching sibling state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use regex_lite::Regex;

use crate::copy::FingerprintStore;
use crate::filter::BuildFilter;
use crate::host::Host;
use crate::model::{Build, Principal};
use crate::tree::VirtualTree;

/// Expanded environment variables of the requesting build.
#[derive(Debug, Clone, Default)]
pub struct EnvVars {
    values: std::collections::BTreeMap<String, String>,
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:\{([A-Za-z0-9_]+)\}|([A-Za-z0-9_]+))").unwrap()
    })
}

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Expand `$VAR` and `${VAR}` references. Unknown variables are left
    /// unexpanded in place.
    pub fn expand(&self, input: &str) -> String {
        variable_pattern()
            .replace_all(input, |caps: &regex_lite::Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or("");
                match self.values.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

/// Sink for the step's console output. The host engine owns the actual
/// console; tests capture lines in memory.
pub trait Listener: Send + Sync {
    fn line(&self, message: &str);
}

/// Writes to the process stdout.
#[derive(Debug, Default)]
pub struct ConsoleListener;

impl Listener for ConsoleListener {
    fn line(&self, message: &str) {
        println!("{message}");
    }
}

/// Collects lines for inspection.
#[derive(Debug, Default)]
pub struct BufferListener {
    lines: Mutex<Vec<String>>,
}

impl BufferListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl Listener for BufferListener {
    fn line(&self, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(message.to_string());
        }
    }
}

/// Host-raised abort flag, observed between file copies.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Context for build resolution.
pub struct PickContext<'a> {
    pub host: &'a Host,

    /// The requesting build (the copier).
    pub copier_build: Arc<Build>,

    /// The identity the requesting build executes under.
    pub principal: Principal,

    pub env: EnvVars,
    pub listener: Arc<dyn Listener>,
    pub verbose: bool,

    /// Expanded name of the job to copy from.
    pub project_name: String,

    /// Optional predicate refining what the selector may pick.
    pub filter: Option<&'a dyn BuildFilter>,
}

impl<'a> PickContext<'a> {
    /// Always-visible log line.
    pub fn log_info(&self, message: impl AsRef<str>) {
        self.listener.line(message.as_ref());
    }

    /// Log line shown only with verbose logging enabled.
    pub fn log_debug(&self, message: impl AsRef<str>) {
        if self.verbose {
            self.listener.line(message.as_ref());
        }
    }

    /// Apply the attached filter; absent filter accepts everything.
    pub fn filter_accepts(&self, candidate: &Arc<Build>) -> bool {
        match self.filter {
            Some(filter) => filter.accepts(candidate, self),
            None => true,
        }
    }

    /// Folder containing the requesting build's job.
    pub fn copier_folder(&self) -> &str {
        self.copier_build.job.folder()
    }
}

/// Context for artifact transfer.
///
/// Cloned per recursive branch; the clone's `target_dir` is overridden
/// while everything else is shared immutably.
#[derive(Clone)]
pub struct CopyContext<'a> {
    pub host: &'a Host,
    pub copier_build: Arc<Build>,
    pub env: EnvVars,
    pub listener: Arc<dyn Listener>,
    pub verbose: bool,

    /// Target base directory of the current branch.
    pub target_dir: PathBuf,

    /// Raw include pattern set (already variable-expanded).
    pub includes: String,

    /// Raw exclude pattern set, if any.
    pub excludes: Option<String>,

    pub flatten: bool,
    pub fingerprint: bool,

    pub abort: AbortSignal,
    pub fingerprints: Arc<dyn FingerprintStore>,

    /// Copy from this tree instead of the build's artifact root (set by
    /// the workspace-snapshot selector).
    pub source_override: Option<Arc<dyn VirtualTree>>,
}

impl<'a> CopyContext<'a> {
    pub fn log_info(&self, message: impl AsRef<str>) {
        self.listener.line(message.as_ref());
    }

    pub fn log_debug(&self, message: impl AsRef<str>) {
        if self.verbose {
            self.listener.line(message.as_ref());
        }
    }

    /// Branch clone with a different target base directory.
    pub fn with_target_dir(&self, target_dir: impl AsRef<Path>) -> Self {
        let mut branch = self.clone();
        branch.target_dir = target_dir.as_ref().to_path_buf();
        branch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_braced_and_bare() {
        let env = EnvVars::new()
            .with("BUILD_NUMBER", "42")
            .with("JOB", "upstream");
        assert_eq!(env.expand("${JOB}-$BUILD_NUMBER"), "upstream-42");
        assert_eq!(env.expand("plain"), "plain");
    }

    #[test]
    fn test_expand_unknown_left_in_place() {
        let env = EnvVars::new();
        assert_eq!(env.expand("${MISSING}/x"), "${MISSING}/x");
        assert_eq!(env.expand("$MISSING"), "$MISSING");
    }

    #[test]
    fn test_expand_adjacent_text() {
        let env = EnvVars::new().with("A", "1");
        assert_eq!(env.expand("x${A}y"), "x1y");
    }

    #[test]
    fn test_buffer_listener_captures() {
        let listener = BufferListener::new();
        listener.line("hello");
        listener.line("world");
        assert_eq!(listener.lines(), vec!["hello", "world"]);
    }

    #[test]
    fn test_abort_signal_shared() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_aborted());
        signal.abort();
        assert!(clone.is_aborted());
    }
}
