//! Extraction of compressed MusicXML (`.mxl`) containers.
//!
//! An `.mxl` file is a zip archive whose `META-INF/container.xml` names the
//! score document through the first `rootfile` element's `full-path`. Older
//! writers sometimes omit the manifest; then the archive must hold exactly
//! one `.xml` or `.musicxml` file outside `META-INF/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use scoreconv_core::{defaults, has_extension, Error, Result};

const NOTATION_EXTENSIONS: &[&str] = &["xml", "musicxml"];

/// Extract `archive` into `dest` and return the path of the score document.
///
/// Runs on the blocking pool. `dest` is created if missing; its removal is
/// left to the caller.
pub async fn extract_notation(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| Error::Internal(format!("Archive extraction task failed: {}", e)))?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let file = File::open(archive)
        .map_err(|e| Error::Staging(format!("Failed to open {}: {}", archive.display(), e)))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::Staging(format!("Not a valid compressed MusicXML file: {}", e)))?;

    std::fs::create_dir_all(dest).map_err(|e| {
        Error::Staging(format!("Failed to create {}: {}", dest.display(), e))
    })?;

    let mut extracted: Vec<PathBuf> = Vec::new();
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| Error::Staging(format!("Corrupt archive entry {}: {}", index, e)))?;

        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };
        let target = dest.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| extract_error(&relative, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| extract_error(&relative, e))?;
        }
        let mut out = File::create(&target).map_err(|e| extract_error(&relative, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| extract_error(&relative, e))?;
        extracted.push(relative);
    }

    let root = resolve_root(dest, &extracted)?;
    debug!(root = %root.display(), entries = extracted.len(), "Resolved compressed score document");
    Ok(dest.join(root))
}

fn extract_error(entry: &Path, e: std::io::Error) -> Error {
    Error::Staging(format!("Failed to extract {}: {}", entry.display(), e))
}

/// Pick the score document among the extracted entries (relative paths).
fn resolve_root(dest: &Path, entries: &[PathBuf]) -> Result<PathBuf> {
    let manifest = Path::new(defaults::CONTAINER_MANIFEST);
    if entries.iter().any(|e| e == manifest) {
        let xml = std::fs::read_to_string(dest.join(manifest))
            .map_err(|e| Error::Staging(format!("Unreadable container manifest: {}", e)))?;
        match rootfile_path(&xml) {
            Some(full_path) => {
                let candidate = PathBuf::from(full_path.trim_start_matches('/'));
                if entries.contains(&candidate) {
                    return Ok(candidate);
                }
                warn!(
                    rootfile = %full_path,
                    "Container manifest points at a missing entry, falling back to extension match"
                );
            }
            None => warn!("Container manifest has no rootfile, falling back to extension match"),
        }
    }

    let candidates: Vec<&PathBuf> = entries
        .iter()
        .filter(|e| !e.starts_with("META-INF"))
        .filter(|e| has_extension(e, NOTATION_EXTENSIONS))
        .collect();

    match candidates.as_slice() {
        [single] => Ok((*single).clone()),
        [] => Err(Error::Staging(
            "No MusicXML file found in the compressed archive".to_string(),
        )),
        many => Err(Error::Staging(format!(
            "Compressed archive holds {} MusicXML files and no usable container manifest",
            many.len()
        ))),
    }
}

/// `full-path` of the first `rootfile` element in a container manifest.
pub fn rootfile_path(container_xml: &str) -> Option<String> {
    static ROOTFILE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = ROOTFILE
        .get_or_init(|| Regex::new(r#"<rootfile\b[^>]*?\bfull-path\s*=\s*["']([^"']+)["']"#).ok())
        .as_ref()?;
    re.captures(container_xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
