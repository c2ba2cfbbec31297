//! Extraction and validation of a job's input properties.

use scoreconv_core::{Error, InputDocument, Job, Result, SourceFormat, ValidatedJob};

/// Property carrying the input document.
pub const TARGET_FILE_PROPERTY: &str = "targetFile";

/// Name older clients use for the input document property.
pub const LEGACY_TARGET_FILE_PROPERTY: &str = "MusicXML File";

/// Property carrying the title of the result document.
pub const RESULT_NAME_PROPERTY: &str = "resultName";

/// Validate a fetched job and pull out what the pipeline needs.
///
/// Checks run in a fixed order so the same payload always yields the same
/// message: result name, document reference, source, format.
pub fn validate(job: &Job) -> Result<ValidatedJob> {
    let result_name = job
        .property(RESULT_NAME_PROPERTY)
        .and_then(|p| p.value_str())
        .ok_or_else(|| Error::Validation("The resultName is not given or empty!".to_string()))?;

    let document = job
        .property(TARGET_FILE_PROPERTY)
        .or_else(|| job.property(LEGACY_TARGET_FILE_PROPERTY))
        .and_then(|p| p.node_value.as_ref())
        .ok_or_else(|| Error::Validation("The MusicXML file object is not given".to_string()))?;

    let source = document
        .source
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::Validation("The MusicXML file needs a source property".to_string())
        })?;

    let declared = document.format.as_deref().unwrap_or_default();
    let format = SourceFormat::from_format(declared).ok_or_else(|| {
        Error::Validation(format!(
            "The MusicXML file must have a XML or MXL format (got '{}')",
            declared
        ))
    })?;

    Ok(ValidatedJob {
        input: InputDocument {
            source: source.to_string(),
            format,
        },
        result_name,
    })
}
