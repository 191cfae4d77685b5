//! JSON-RPC message scaffolding.
//!
//! The bridge issues only two requests of its own (`initialize`, `shutdown`).
//! Their ids carry a reserved `bridge:` prefix so response routing can never
//! collide with ids the host chose for its own requests — everything without
//! that prefix is relayed untouched.

use std::path::Path;

use serde::Serialize;

use crate::error::{BridgeError, Result};

/// Id prefix reserved for bridge-issued requests.
pub(crate) const BRIDGE_ID_PREFIX: &str = "bridge:";

pub(crate) fn bridge_id(n: u64) -> String {
    format!("{BRIDGE_ID_PREFIX}{n}")
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: String, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Initialize payload with the merged settings embedded verbatim as
/// `initializationOptions`.
pub(crate) fn initialize_params(
    root_uri: &str,
    initialization_options: &serde_json::Value,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            },
            "workspace": {
                "configuration": true
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    });
    if !initialization_options.is_null() {
        params["initializationOptions"] = initialization_options.clone();
    }
    params
}

/// Where an incoming server frame should go.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Response to a bridge-issued request (`bridge:` id with result/error).
    BridgeResponse { id: String },
    /// A request from the server, carrying its id for a reply.
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Anything else: notifications, responses to host requests. Relayed.
    Relay,
}

pub(crate) fn classify(frame: &serde_json::Value) -> Incoming {
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    if has_result_or_error
        && frame.get("method").is_none()
        && let Some(id) = frame.get("id").and_then(|id| id.as_str())
        && id.starts_with(BRIDGE_ID_PREFIX)
    {
        return Incoming::BridgeResponse { id: id.to_string() };
    }

    if let (Some(id), Some(method)) = (frame.get("id"), frame.get("method").and_then(|m| m.as_str()))
    {
        return Incoming::ServerRequest {
            id: id.clone(),
            method: method.to_string(),
            params: frame.get("params").cloned(),
        };
    }

    Incoming::Relay
}

/// Answer a `workspace/configuration` request from the merged settings tree.
///
/// Each requested item resolves its `section` as a dotted path into the
/// settings; items without a section get the whole tree; unknown sections
/// resolve to null, per the protocol's contract.
pub(crate) fn configuration_response(
    id: serde_json::Value,
    params: Option<&serde_json::Value>,
    settings: &serde_json::Value,
) -> serde_json::Value {
    let items = params
        .and_then(|p| p.get("items"))
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();

    let result: Vec<serde_json::Value> = items
        .iter()
        .map(|item| match item.get("section").and_then(|s| s.as_str()) {
            Some(section) => section_lookup(settings, section),
            None => settings.clone(),
        })
        .collect();

    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn section_lookup(settings: &serde_json::Value, section: &str) -> serde_json::Value {
    let mut current = settings;
    for part in section.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return serde_json::Value::Null,
        }
    }
    current.clone()
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url> {
    url::Url::from_file_path(path).map_err(|()| BridgeError::PathToUri {
        path: path.display().to_string(),
    })
}
