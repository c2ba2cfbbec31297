//! GraphQL documents used by the worker.
//!
//! Field and argument names are the store's wire contract. Each document is a
//! named operation so `operationName` on the wire always resolves.

use scoreconv_core::defaults;

pub const OP_CONTROL_ACTION_REQUEST: &str = "ControlActionRequest";
pub const OP_CONTROL_ACTION: &str = "ControlAction";
pub const OP_UPDATE_CONTROL_ACTION: &str = "UpdateControlAction";
pub const OP_CREATE_DIGITAL_DOCUMENT: &str = "CreateDigitalDocument";
pub const OP_ADD_RESULT: &str = "AddActionInterfaceThingInterface";

/// Fetch one job with its input properties.
pub const CONTROL_ACTION_QUERY: &str = r#"
query ControlAction($identifier: String!) {
    ControlAction(identifier: $identifier) {
        actionStatus
        identifier
        object {
            ... on PropertyValue {
                value
                name
                nodeValue {
                    ... on DigitalDocument {
                        format
                        source
                    }
                }
            }
        }
    }
}
"#;

/// Set a job's status and error message.
pub const UPDATE_CONTROL_ACTION_MUTATION: &str = r#"
mutation UpdateControlAction($identifier: ID!, $status: ControlActionStatus!, $error: String) {
    UpdateControlAction(
        identifier: $identifier,
        actionStatus: $status,
        error: $error
    ) {
        identifier
        actionStatus
        error
    }
}
"#;

/// Link a result document to its job.
pub const ADD_RESULT_MUTATION: &str = r#"
mutation AddActionInterfaceThingInterface($controlActionIdentifier: String!, $digitalDocumentIdentifier: String!) {
    AddActionInterfaceThingInterface(
        from: {identifier: $controlActionIdentifier, type: ControlAction}
        to: {identifier: $digitalDocumentIdentifier, type: DigitalDocument}
        field: result
    ) {
        from {
            __typename
        }
        to {
            __typename
        }
    }
}
"#;

/// Create the result document. Metadata other than source and name is fixed.
pub fn create_digital_document_mutation() -> String {
    format!(
        r#"
mutation CreateDigitalDocument($source: String!, $name: String!) {{
    CreateDigitalDocument(
        contributor: "{contributor}",
        creator: "{creator}",
        description: "{description}",
        format: "{format}",
        language: {language},
        source: $source,
        subject: "{subject}",
        title: $name,
        name: $name
    ) {{
        identifier
        title
        source
    }}
}}
"#,
        contributor = defaults::RESULT_CONTRIBUTOR,
        creator = defaults::RESULT_CREATOR,
        description = defaults::RESULT_DESCRIPTION,
        format = defaults::RESULT_FORMAT,
        language = defaults::RESULT_LANGUAGE,
        subject = defaults::RESULT_SUBJECT,
    )
}

/// Notifications for jobs created under one entry point.
///
/// The entry point is inlined as a string literal; JSON string escaping is
/// valid GraphQL string syntax.
pub fn control_action_request_subscription(entry_point_identifier: &str) -> String {
    let literal = serde_json::Value::String(entry_point_identifier.to_string()).to_string();
    format!(
        r#"
subscription ControlActionRequest {{
    ControlActionRequest(entryPointIdentifier: {literal}) {{
        identifier
    }}
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_document_carries_fixed_metadata() {
        let doc = create_digital_document_mutation();
        assert!(doc.contains(r#"contributor: "https://videodock.com""#));
        assert!(doc.contains(r#"creator: "Algorithm POC""#));
        assert!(doc.contains(r#"format: "mei""#));
        assert!(doc.contains("language: en,"));
        assert!(doc.contains(r#"subject: "Verovio, XML to MEI""#));
        assert!(doc.contains("title: $name"));
    }

    #[test]
    fn test_subscription_escapes_entry_point() {
        let doc = control_action_request_subscription("ep-1");
        assert!(doc.contains(r#"ControlActionRequest(entryPointIdentifier: "ep-1")"#));

        let doc = control_action_request_subscription(r#"a"b"#);
        assert!(doc.contains(r#"entryPointIdentifier: "a\"b""#));
    }

    #[test]
    fn test_documents_are_named_operations() {
        assert!(CONTROL_ACTION_QUERY.contains("query ControlAction("));
        assert!(UPDATE_CONTROL_ACTION_MUTATION.contains("mutation UpdateControlAction("));
        assert!(ADD_RESULT_MUTATION.contains("field: result"));
    }
}
