//! Artifact transfer: composite-build expansion and the copy backend.
//!
//! [`copy_artifacts_from`] walks composite builds (module aggregates and
//! multi-configuration builds) down to leaves, runs the file-set scan per
//! leaf and drives the [`Copier`] lifecycle around each leaf's files.
//! Outcomes merge as a commutative monoid; zero files copied is a
//! legitimate outcome, not an error.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::CopyContext;
use crate::model::{Build, BuildKind, BuildRef};
use crate::scan::{FileSet, ScanError, ScannedFile};
use crate::tree::VirtualTree;

/// Transfer errors. Not-found conditions are never errors; they surface
/// as [`CopyOutcome::NoFilesCopied`].
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Pattern(#[from] ScanError),

    /// The host engine aborted the running build. Partially copied files
    /// are left as-is.
    #[error("artifact copy interrupted by build abort")]
    Interrupted,
}

/// Aggregate result of a transfer.
///
/// Merging is commutative, associative and idempotent: a set of branch
/// outcomes reduces to `FilesCopied` iff any branch copied a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyOutcome {
    NoFilesCopied,
    FilesCopied,
}

impl CopyOutcome {
    pub fn merge(self, other: CopyOutcome) -> CopyOutcome {
        match (self, other) {
            (CopyOutcome::NoFilesCopied, CopyOutcome::NoFilesCopied) => CopyOutcome::NoFilesCopied,
            _ => CopyOutcome::FilesCopied,
        }
    }

    pub fn copied(self) -> bool {
        self == CopyOutcome::FilesCopied
    }
}

/// A recorded content fingerprint linking a copied file to its source and
/// destination builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    /// Base name of the copied file.
    pub file_name: String,

    /// Hex SHA-256 of the file contents.
    pub sha256: String,

    pub source: BuildRef,
    pub destination: BuildRef,
}

/// Append-only store of fingerprints for provenance queries. Writes never
/// contend with the read-only job/build state.
pub trait FingerprintStore: Send + Sync {
    fn record(&self, record: FingerprintRecord);
}

/// In-memory store; the host engine supplies a durable one.
#[derive(Debug, Default)]
pub struct InMemoryFingerprintStore {
    records: Mutex<Vec<FingerprintRecord>>,
}

impl InMemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<FingerprintRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl FingerprintStore for InMemoryFingerprintStore {
    fn record(&self, record: FingerprintRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

/// Replaceable copy backend. Exactly one `init`/`end` pair brackets each
/// leaf's file set; `end` runs even when a copy fails mid-stream.
pub trait Copier: Send + Sync {
    fn init(&self, _source: &Build, _ctx: &CopyContext<'_>) -> Result<(), CopyError> {
        Ok(())
    }

    /// Copy one file. When the context's fingerprint flag is set, a
    /// content fingerprint must be recorded for the destination file.
    fn copy_one(
        &self,
        tree: &dyn VirtualTree,
        file: &ScannedFile,
        destination: &Path,
        source: &Build,
        ctx: &CopyContext<'_>,
    ) -> Result<(), CopyError>;

    fn end(&self, _ctx: &CopyContext<'_>) -> Result<(), CopyError> {
        Ok(())
    }
}

/// Default backend: streams bytes to the destination, hashing along the
/// way when fingerprinting is on.
#[derive(Debug, Default)]
pub struct FingerprintingCopier;

impl Copier for FingerprintingCopier {
    fn copy_one(
        &self,
        tree: &dyn VirtualTree,
        file: &ScannedFile,
        destination: &Path,
        source: &Build,
        ctx: &CopyContext<'_>,
    ) -> Result<(), CopyError> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write through a uniquely named sibling and rename into place, so
        // a concurrent reader of the destination never sees a short file.
        let temp = destination.with_file_name(format!(
            ".{}.{}",
            file.file_name(),
            uuid::Uuid::new_v4().simple()
        ));
        let mut reader = tree.open(&file.fragments)?;
        let mut writer = std::fs::File::create(&temp)?;

        let mut hasher = ctx.fingerprint.then(Sha256::new);
        let mut buffer = [0u8; 64 * 1024];
        loop {
            // A build abort cuts off the current file mid-stream; the
            // partially written temporary is never renamed into place.
            if ctx.abort.is_aborted() {
                return Err(CopyError::Interrupted);
            }
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read])?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buffer[..read]);
            }
        }
        writer.flush()?;
        drop(writer);
        std::fs::rename(&temp, destination)?;

        if let Some(hasher) = hasher {
            ctx.fingerprints.record(FingerprintRecord {
                file_name: file.file_name().to_string(),
                sha256: hex::encode(hasher.finalize()),
                source: source.build_ref(),
                destination: ctx.copier_build.build_ref(),
            });
        }
        Ok(())
    }
}

/// Transfer artifacts of `source`, expanding composite builds.
///
/// Module aggregates copy the aggregate's own artifacts and each module's
/// most recent build into the same target directory. Multi-configuration
/// builds fan out into per-configuration subdirectories. Branch outcomes
/// merge through the [`CopyOutcome`] monoid; a failed branch does not
/// undo files copied by siblings that completed first.
pub fn copy_artifacts_from(
    source: &Arc<Build>,
    copier: &dyn Copier,
    ctx: &CopyContext<'_>,
) -> Result<CopyOutcome, CopyError> {
    match &source.kind {
        BuildKind::ModuleAggregate(modules) => {
            let mut outcome = copy_leaf(source, copier, ctx)?;
            for module in modules {
                outcome = outcome.merge(copy_leaf(module, copier, ctx)?);
            }
            Ok(outcome)
        }
        BuildKind::Matrix(runs) => {
            let mut outcome = CopyOutcome::NoFilesCopied;
            for run in runs {
                let branch = ctx.with_target_dir(ctx.target_dir.join(&run.configuration));
                outcome = outcome.merge(copy_artifacts_from(&run.build, copier, &branch)?);
            }
            Ok(outcome)
        }
        BuildKind::Leaf => copy_leaf(source, copier, ctx),
    }
}

fn copy_leaf(
    source: &Arc<Build>,
    copier: &dyn Copier,
    ctx: &CopyContext<'_>,
) -> Result<CopyOutcome, CopyError> {
    ctx.log_debug(format!("Copying artifacts from {}", source.full_label()));
    std::fs::create_dir_all(&ctx.target_dir)?;

    let tree: Arc<dyn VirtualTree> = match (&ctx.source_override, &source.artifacts) {
        (Some(tree), _) => Arc::clone(tree),
        (None, Some(tree)) => Arc::clone(tree),
        (None, None) => {
            ctx.log_debug("No artifacts to copy");
            return Ok(CopyOutcome::NoFilesCopied);
        }
    };

    let file_set = FileSet::new(&ctx.includes, ctx.excludes.as_deref())?;
    let files = file_set.scan(tree.as_ref())?;

    copier.init(source, ctx)?;
    let copied = copy_files(&files, tree.as_ref(), source, copier, ctx);
    let ended = copier.end(ctx);
    let count = copied?;
    ended?;

    ctx.log_info(format!(
        "Copied {} artifact{} from {}",
        count,
        if count == 1 { "" } else { "s" },
        source.full_label()
    ));
    if count > 0 {
        Ok(CopyOutcome::FilesCopied)
    } else {
        Ok(CopyOutcome::NoFilesCopied)
    }
}

fn copy_files(
    files: &[ScannedFile],
    tree: &dyn VirtualTree,
    source: &Build,
    copier: &dyn Copier,
    ctx: &CopyContext<'_>,
) -> Result<usize, CopyError> {
    for file in files {
        if ctx.abort.is_aborted() {
            return Err(CopyError::Interrupted);
        }
        let destination = destination_path(ctx, file);
        ctx.log_debug(format!("Copying to {}", destination.display()));
        copier.copy_one(tree, file, &destination, source, ctx)?;
    }
    Ok(files.len())
}

/// Flattened mode collapses directory structure (last write wins on name
/// collisions); preserving mode recreates the relative path.
fn destination_path(ctx: &CopyContext<'_>, file: &ScannedFile) -> PathBuf {
    if ctx.flatten {
        ctx.target_dir.join(file.file_name())
    } else {
        let mut path = ctx.target_dir.clone();
        for fragment in &file.fragments {
            path.push(fragment);
        }
        path
    }
}
