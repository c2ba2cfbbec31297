//! Core data models for scoreconv.
//!
//! These mirror the graph store's entities as far as the worker reads or
//! writes them. Every field the remote API may leave out is optional here;
//! deciding whether a missing field is an error is the job of the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Externally visible status of a job (a graph `ControlAction`).
///
/// Transitions are monotonic: `Pending -> Active -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "PotentialActionStatus", alias = "pending")]
    Pending,
    #[serde(rename = "ActiveActionStatus", alias = "running")]
    Active,
    #[serde(rename = "CompletedActionStatus", alias = "complete")]
    Completed,
    #[serde(rename = "FailedActionStatus", alias = "error")]
    Failed,
}

impl JobStatus {
    /// Enum value as sent in graph mutations.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PotentialActionStatus",
            JobStatus::Active => "ActiveActionStatus",
            JobStatus::Completed => "CompletedActionStatus",
            JobStatus::Failed => "FailedActionStatus",
        }
    }

    /// Completed and Failed are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A conversion request as returned by the `ControlAction` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub identifier: String,
    #[serde(rename = "actionStatus", default)]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Input attributes in the order the store returned them.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub object: Vec<PropertyValue>,
}

impl Job {
    /// First attached property with the given name.
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.object
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
    }
}

/// A named attribute attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<JsonValue>,
    #[serde(rename = "nodeValue", default)]
    pub node_value: Option<DocumentRef>,
}

impl PropertyValue {
    /// Scalar value rendered as a string, trimmed.
    ///
    /// Returns `None` for null, empty strings and non-scalar values.
    pub fn value_str(&self) -> Option<String> {
        let rendered = match self.value.as_ref()? {
            JsonValue::String(s) => s.trim().to_string(),
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Bool(b) => b.to_string(),
            _ => return None,
        };
        if rendered.is_empty() {
            None
        } else {
            Some(rendered)
        }
    }
}

/// Reference to a `DigitalDocument` as seen through a property's `nodeValue`.
///
/// A node of another type comes back as an empty object, so every field is
/// optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A result document created by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub identifier: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

// =============================================================================
// INPUT FORMATS
// =============================================================================

/// Input notation formats the worker accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Uncompressed MusicXML.
    MusicXml,
    /// Zip container wrapping a MusicXML document.
    CompressedMusicXml,
}

impl SourceFormat {
    /// Map a document's `format` tag to a known input format.
    pub fn from_format(format: &str) -> Option<Self> {
        match format.trim().to_ascii_lowercase().as_str() {
            "xml"
            | "musicxml"
            | "application/vnd.recordare.musicxml+xml"
            | "application/xml"
            | "text/xml" => Some(SourceFormat::MusicXml),
            "mxl" | "application/vnd.recordare.musicxml" => Some(SourceFormat::CompressedMusicXml),
            _ => None,
        }
    }

    /// Canonical file extension, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            SourceFormat::MusicXml => "xml",
            SourceFormat::CompressedMusicXml => "mxl",
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, SourceFormat::CompressedMusicXml)
    }
}

/// The input side of a validated job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDocument {
    pub source: String,
    pub format: SourceFormat,
}

/// The two fields a job must carry to be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedJob {
    pub input: InputDocument,
    pub result_name: String,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_status_wire_names() {
        assert_eq!(
            serde_json::to_value(JobStatus::Active).unwrap(),
            json!("ActiveActionStatus")
        );
        assert_eq!(JobStatus::Failed.as_wire_str(), "FailedActionStatus");
        let parsed: JobStatus = serde_json::from_value(json!("CompletedActionStatus")).unwrap();
        assert_eq!(parsed, JobStatus::Completed);
    }

    #[test]
    fn test_job_status_legacy_aliases() {
        let parsed: JobStatus = serde_json::from_value(json!("running")).unwrap();
        assert_eq!(parsed, JobStatus::Active);
        let parsed: JobStatus = serde_json::from_value(json!("error")).unwrap();
        assert_eq!(parsed, JobStatus::Failed);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }

    #[test]
    fn test_job_deserializes_graph_payload() {
        let job: Job = serde_json::from_value(json!({
            "actionStatus": "PotentialActionStatus",
            "identifier": "job-1",
            "object": [
                { "name": "resultName", "value": "Sonata", "nodeValue": null },
                {
                    "name": "targetFile",
                    "value": null,
                    "nodeValue": { "format": "xml", "source": "http://x/a.xml" }
                }
            ]
        }))
        .unwrap();

        assert_eq!(job.status, Some(JobStatus::Pending));
        assert_eq!(job.object.len(), 2);
        assert_eq!(
            job.property("resultName").and_then(|p| p.value_str()),
            Some("Sonata".to_string())
        );
        let doc = job
            .property("targetFile")
            .and_then(|p| p.node_value.clone())
            .unwrap();
        assert_eq!(doc.source.as_deref(), Some("http://x/a.xml"));
    }

    #[test]
    fn test_job_tolerates_null_object_and_foreign_node() {
        let job: Job = serde_json::from_value(json!({
            "identifier": "job-2",
            "object": null
        }))
        .unwrap();
        assert!(job.object.is_empty());
        assert_eq!(job.status, None);

        let pv: PropertyValue =
            serde_json::from_value(json!({ "name": "targetFile", "nodeValue": {} })).unwrap();
        assert_eq!(pv.node_value, Some(DocumentRef::default()));
    }

    #[test]
    fn test_value_str_handles_empty_and_scalars() {
        let pv = PropertyValue {
            value: Some(json!("   ")),
            ..Default::default()
        };
        assert_eq!(pv.value_str(), None);

        let pv = PropertyValue {
            value: Some(json!(42)),
            ..Default::default()
        };
        assert_eq!(pv.value_str(), Some("42".to_string()));

        let pv = PropertyValue {
            value: Some(json!({"a": 1})),
            ..Default::default()
        };
        assert_eq!(pv.value_str(), None);
    }

    #[test]
    fn test_source_format_mapping() {
        assert_eq!(SourceFormat::from_format("xml"), Some(SourceFormat::MusicXml));
        assert_eq!(
            SourceFormat::from_format("application/vnd.recordare.musicxml+xml"),
            Some(SourceFormat::MusicXml)
        );
        assert_eq!(
            SourceFormat::from_format(" MXL "),
            Some(SourceFormat::CompressedMusicXml)
        );
        assert_eq!(SourceFormat::from_format("pdf"), None);
        assert!(SourceFormat::CompressedMusicXml.is_compressed());
        assert_eq!(SourceFormat::MusicXml.extension(), "xml");
    }
}
