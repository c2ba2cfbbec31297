//! Where converted output ends up before the result document is created.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use scoreconv_core::{Error, Result};

/// Decides the `source` reference of a result document.
///
/// A local store hands back the converted file's own path, which is removed
/// again during cleanup. A persistent store first copies the file into its
/// directory and returns either a public URL under `base_url` or the copied
/// path.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    dir: Option<PathBuf>,
    base_url: Option<String>,
}

impl ResultStore {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn persistent(dir: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            dir: Some(dir.into()),
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// Make `output` available and return its reference.
    #[instrument(skip(self, output), fields(subsystem = "jobs", component = "results", output = %output.display()))]
    pub async fn publish(&self, output: &Path) -> Result<String> {
        let Some(dir) = &self.dir else {
            return Ok(output.to_string_lossy().into_owned());
        };

        let name = output
            .file_name()
            .ok_or_else(|| Error::Publish(format!("{} has no file name", output.display())))?;

        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            Error::Publish(format!("Failed to create result directory {}: {}", dir.display(), e))
        })?;

        let dest = dir.join(name);
        let bytes = tokio::fs::copy(output, &dest).await.map_err(|e| {
            Error::Publish(format!(
                "Failed to persist {} to {}: {}",
                output.display(),
                dest.display(),
                e
            ))
        })?;
        debug!(bytes, dest = %dest.display(), "Result persisted");

        Ok(match &self.base_url {
            Some(base) => format!("{}/{}", base, name.to_string_lossy()),
            None => dest.to_string_lossy().into_owned(),
        })
    }
}
