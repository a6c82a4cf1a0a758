//! Per-run workspace management.
//!
//! A [`RunWorkspace`] owns a `run-<id>` directory under the configured work
//! root with one subdirectory per stage. Intermediate artifacts live there
//! and are removed when the workspace is dropped; only the composed output
//! is moved out via [`RunWorkspace::persist_output`].

use std::path::{Path, PathBuf};

use sc_core::{RunId, Stage};
use tempfile::TempDir;

/// Workspace for one pipeline run.
///
/// # Example
///
/// ```no_run
/// use sc_av::RunWorkspace;
/// use sc_core::{RunId, Stage};
///
/// let ws = RunWorkspace::create(std::path::Path::new("/tmp/slidecast"), &RunId::new()).unwrap();
/// let audio = ws.stage_file(Stage::SynthesizeSpeech, "segment_000.mp3");
/// // ... produce artifacts, compose into ws.stage_file(Stage::Compose, "video.mp4") ...
/// ```
pub struct RunWorkspace {
    temp_dir: TempDir,
}

impl RunWorkspace {
    /// Create `<root>/run-<id>/` with a subdirectory for every stage.
    pub fn create(root: &Path, run_id: &RunId) -> sc_core::Result<Self> {
        std::fs::create_dir_all(root)?;
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("run-{run_id}"))
            .rand_bytes(0)
            .tempdir_in(root)
            .map_err(|e| {
                sc_core::Error::tool("workspace", format!("failed to create run dir: {e}"))
            })?;

        for stage in Stage::ALL {
            std::fs::create_dir_all(temp_dir.path().join(stage.dir_name()))?;
        }

        tracing::debug!("run workspace at {}", temp_dir.path().display());
        Ok(Self { temp_dir })
    }

    /// Path to the run directory.
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Directory holding the artifacts of one stage.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.temp_dir.path().join(stage.dir_name())
    }

    /// Path for a named file inside a stage directory.
    pub fn stage_file(&self, stage: Stage, name: &str) -> PathBuf {
        self.stage_dir(stage).join(name)
    }

    /// Move `produced` to `dest`, creating parent directories as needed.
    ///
    /// Tries a rename first (same filesystem), falling back to copy+remove.
    pub fn persist_output(&self, produced: &Path, dest: &Path) -> sc_core::Result<PathBuf> {
        if !produced.exists() {
            return Err(sc_core::Error::tool(
                "workspace",
                format!("output file does not exist: {}", produced.display()),
            ));
        }

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if std::fs::rename(produced, dest).is_err() {
            std::fs::copy(produced, dest).map_err(|e| {
                sc_core::Error::tool(
                    "workspace",
                    format!("failed to copy output to destination: {e}"),
                )
            })?;
            let _ = std::fs::remove_file(produced);
        }

        Ok(dest.to_path_buf())
    }
}

impl std::fmt::Debug for RunWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunWorkspace")
            .field("root", &self.temp_dir.path())
            .finish()
    }
}
