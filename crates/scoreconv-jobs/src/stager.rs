//! Retrieval of remote input documents into the work directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use scoreconv_core::{
    defaults, has_extension, sanitize_filename, Error, InputDocument, Result, SourceFormat,
};

use crate::archive;
use crate::scratch::Scratch;

/// Downloads input documents and unpacks compressed containers.
///
/// Every file is named `<stamp>-<base name>` where the stamp is a fresh
/// time-ordered UUID, so concurrent runs never share a path even when their
/// sources have the same base name.
#[derive(Debug, Clone)]
pub struct SourceStager {
    client: reqwest::Client,
    work_dir: PathBuf,
    download_timeout: Duration,
}

impl SourceStager {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            work_dir: work_dir.into(),
            download_timeout: Duration::from_secs(defaults::DOWNLOAD_TIMEOUT_SECS),
        }
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Stage `input` and return the path of a plain MusicXML file.
    ///
    /// Every path created is registered in `scratch` before it is written;
    /// removing them is the caller's job.
    #[instrument(skip(self, input, scratch), fields(subsystem = "jobs", component = "stager", source = %input.source))]
    pub async fn stage(&self, input: &InputDocument, scratch: &mut Scratch) -> Result<PathBuf> {
        let url = Url::parse(&input.source)
            .map_err(|e| Error::Staging(format!("Invalid source URL '{}': {}", input.source, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Staging(format!(
                "Unsupported source URL scheme '{}'",
                url.scheme()
            )));
        }

        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            Error::Staging(format!(
                "Failed to create work directory {}: {}",
                self.work_dir.display(),
                e
            ))
        })?;

        let compressed = input.format.is_compressed();
        let staged = self.work_dir.join(staged_file_name(&url, input.format));
        scratch.track_file(&staged);
        self.download(&url, &staged).await?;

        if !compressed && !has_extension(&staged, &["mxl"]) {
            return Ok(staged);
        }

        let extract_dir = extraction_dir(&staged);
        scratch.track_dir(&extract_dir);
        archive::extract_notation(&staged, &extract_dir).await
    }

    async fn download(&self, url: &Url, dest: &Path) -> Result<()> {
        let start = Instant::now();
        debug!(url = %url, path = %dest.display(), "Downloading source document");

        let mut response = self
            .client
            .get(url.clone())
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| Error::Staging(format!("Failed to download {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Staging(format!(
                "Download of {} failed with HTTP {}",
                url, status
            )));
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            Error::Staging(format!("Failed to create {}: {}", dest.display(), e))
        })?;

        let mut bytes: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::Staging(format!("Download of {} interrupted: {}", url, e)))?
        {
            file.write_all(&chunk).await.map_err(|e| {
                Error::Staging(format!("Failed to write {}: {}", dest.display(), e))
            })?;
            bytes += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| {
            Error::Staging(format!("Failed to write {}: {}", dest.display(), e))
        })?;

        info!(
            bytes,
            duration_ms = start.elapsed().as_millis() as u64,
            path = %dest.display(),
            "Source document downloaded"
        );
        Ok(())
    }
}

/// `<stamp>-<base name>` with an extension that matches the declared format.
fn staged_file_name(url: &Url, format: SourceFormat) -> String {
    let base = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(sanitize_filename)
        .unwrap_or_else(|| defaults::FALLBACK_SOURCE_NAME.to_string());

    let base = match format {
        SourceFormat::CompressedMusicXml if !has_extension(&base, &["mxl"]) => {
            format!("{}.mxl", base)
        }
        SourceFormat::MusicXml if !has_extension(&base, &["xml", "musicxml", "mxl"]) => {
            format!("{}.xml", base)
        }
        _ => base,
    };

    format!("{}-{}", Uuid::now_v7().simple(), base)
}

/// Directory next to the archive, named after its stem.
fn extraction_dir(archive: &Path) -> PathBuf {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    archive.with_file_name(format!("{}.d", stem))
}
