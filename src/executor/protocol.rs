//! Wire types shared by the executor host and its HTTP client.

use serde::{Deserialize, Serialize};

pub const STILL_RUNNING: &str = "Code is still running, please try again later";
pub const ID_NOT_FOUND: &str = "Id not found";

/// Backslashes are replaced before transport and restored by the host.
const BACKSLASH_ESCAPE: &str = "%@";

pub fn escape_script(script: &str) -> String {
    script.replace('\\', BACKSLASH_ESCAPE)
}

pub fn unescape_script(script: &str) -> String {
    script.replace(BACKSLASH_ESCAPE, "\\")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
}

impl VariableItem {
    pub fn table(records_json: String) -> Self {
        Self {
            kind: "table".into(),
            data: records_json,
        }
    }

    pub fn image(base64_jpeg: String) -> Self {
        Self {
            kind: "image".into(),
            data: base64_jpeg,
        }
    }

    pub fn string(text: String) -> Self {
        Self {
            kind: "string".into(),
            data: text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub id: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecuteResponse {
    Failed {
        error: String,
        #[serde(default)]
        trace: String,
        #[serde(default)]
        id: String,
    },
    Ok {
        ok: String,
        #[serde(default)]
        output: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadResponse {
    Failed { error: String },
    Ok { result: Vec<VariableItem> },
}

/// Body of `/rollback` and `/release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequest {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AckResponse {
    Failed { error: String },
    Ok { ok: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub que: usize,
}
