pub mod content;
pub mod paths;
pub mod terminal;

pub use content::{DocumentPath, decode_content, encode_content};
pub use terminal::{
    MAX_CONTROL_FRAME_BYTES, RawFrame, TerminalControl, TerminalOutput, decode_terminal_frame,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of one backend-provisioned workspace.
pub type WorkspaceId = String;

/// Correlates a tagged request with its reply on the workspace connection.
pub type RequestId = u64;

/// Event tags the workspace backend puts in the inbound `message` field.
pub mod tags {
    pub const PROJECT_CREATED: &str = "Project created successfully";
    /// Spelled the way the backend spells it.
    pub const TREE_GENERATED: &str = "Succesfully generated tree";
    pub const FILE_RETRIEVED: &str = "File retrieved successfully";
    pub const FILE_CREATED: &str = "File created successfully";
    pub const FILE_UPDATED: &str = "File updated successfully";
    pub const FILE_DELETED: &str = "File deleted successfully";
    pub const FOLDER_CREATED: &str = "Folder created successfully";
    pub const FOLDER_DELETED: &str = "Folder deleted successfully";
    pub const TERMINAL_OUTPUT: &str = "terminal:output";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {message}")]
    Malformed { message: String },
    #[error("invalid content encoding: {0}")]
    InvalidContent(#[from] base64::DecodeError),
    #[error("content is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Client-to-backend envelope on the workspace connection.
///
/// `payload` is opaque to the transport. `requestId` is only present on
/// requests that expect a correlated reply.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl OutboundEnvelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Backend-to-client envelope on the workspace connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    pub success: bool,
    /// Logical event tag used for multiplexed dispatch.
    pub message: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
            message: e.to_string(),
        })
    }
}

/// Project templates the backend can provision.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Python,
    Nodejs,
    Golang,
    Cpp,
    React,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Nodejs => "nodejs",
            Self::Golang => "golang",
            Self::Cpp => "cpp",
            Self::React => "react",
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(Self::Python),
            "nodejs" | "node" => Ok(Self::Nodejs),
            "golang" | "go" => Ok(Self::Golang),
            "cpp" | "c++" => Ok(Self::Cpp),
            "react" => Ok(Self::React),
            other => Err(format!(
                "unknown project type: {other} (expected python, nodejs, golang, cpp or react)"
            )),
        }
    }
}

/// Typed requests understood by the workspace backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum WorkspaceRequest {
    #[serde(rename_all = "camelCase")]
    InitProject { project_type: ProjectType },
    GetTree,
    #[serde(rename_all = "camelCase")]
    GetFile { file_name: String, file_path: String },
    /// `content` is the wire-safe encoding produced by [`encode_content`].
    #[serde(rename_all = "camelCase")]
    UpdateFile {
        file_name: String,
        file_path: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateFile { file_name: String, file_path: String },
    #[serde(rename_all = "camelCase")]
    CreateFolder {
        folder_name: String,
        folder_path: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteFile { file_name: String, file_path: String },
    #[serde(rename_all = "camelCase")]
    DeleteFolder { file_path: String },
    RequestTerminal { instruction: String },
}

impl WorkspaceRequest {
    /// The `type` string this request is sent under.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitProject { .. } => "initProject",
            Self::GetTree => "getTree",
            Self::GetFile { .. } => "getFile",
            Self::UpdateFile { .. } => "updateFile",
            Self::CreateFile { .. } => "createFile",
            Self::CreateFolder { .. } => "createFolder",
            Self::DeleteFile { .. } => "deleteFile",
            Self::DeleteFolder { .. } => "deleteFolder",
            Self::RequestTerminal { .. } => "requestTerminal",
        }
    }

    /// The tag the backend replies with on success.
    pub fn reply_tag(&self) -> &'static str {
        match self {
            Self::InitProject { .. } => tags::PROJECT_CREATED,
            Self::GetTree => tags::TREE_GENERATED,
            Self::GetFile { .. } => tags::FILE_RETRIEVED,
            Self::UpdateFile { .. } => tags::FILE_UPDATED,
            Self::CreateFile { .. } => tags::FILE_CREATED,
            Self::CreateFolder { .. } => tags::FOLDER_CREATED,
            Self::DeleteFile { .. } => tags::FILE_DELETED,
            Self::DeleteFolder { .. } => tags::FOLDER_DELETED,
            Self::RequestTerminal { .. } => tags::TERMINAL_OUTPUT,
        }
    }

    pub fn to_envelope(&self) -> Result<OutboundEnvelope, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        let payload = value
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        Ok(OutboundEnvelope::new(self.kind(), payload))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// One entry of the workspace file tree payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub children: Vec<FileNode>,
    pub path: String,
}

impl FileNode {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    /// Depth-first lookup by absolute path.
    pub fn find(&self, path: &str) -> Option<&FileNode> {
        if self.path == path {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(path))
    }

    /// Paths of every file below this node, depth-first.
    pub fn file_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_files(&mut out);
        out
    }

    fn collect_files<'a>(&'a self, out: &mut Vec<&'a str>) {
        if !self.is_folder() {
            out.push(&self.path);
        }
        for child in &self.children {
            child.collect_files(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_file_envelope_format() {
        let req = WorkspaceRequest::GetFile {
            file_name: "b.txt".to_string(),
            file_path: "a".to_string(),
        };
        let env = req.to_envelope().unwrap();
        assert_eq!(env.kind, "getFile");
        assert_eq!(env.payload, json!({"fileName": "b.txt", "filePath": "a"}));
        assert_eq!(
            env.to_json().unwrap(),
            r#"{"type":"getFile","payload":{"fileName":"b.txt","filePath":"a"}}"#
        );
    }

    #[test]
    fn unit_request_gets_empty_object_payload() {
        let env = WorkspaceRequest::GetTree.to_envelope().unwrap();
        assert_eq!(env.kind, "getTree");
        assert_eq!(env.payload, json!({}));
    }

    #[test]
    fn kind_matches_serde_tag() {
        let requests = vec![
            WorkspaceRequest::InitProject {
                project_type: ProjectType::Golang,
            },
            WorkspaceRequest::CreateFolder {
                folder_name: "src".to_string(),
                folder_path: "".to_string(),
            },
            WorkspaceRequest::DeleteFolder {
                file_path: "src".to_string(),
            },
            WorkspaceRequest::RequestTerminal {
                instruction: "ls".to_string(),
            },
        ];
        for req in requests {
            let value = serde_json::to_value(&req).unwrap();
            assert_eq!(value["type"], req.kind());
        }
    }

    #[test]
    fn init_project_payload_uses_backend_field_names() {
        let env = WorkspaceRequest::InitProject {
            project_type: ProjectType::Nodejs,
        }
        .to_envelope()
        .unwrap();
        assert_eq!(env.payload, json!({"projectType": "nodejs"}));
    }

    #[test]
    fn request_id_omitted_when_absent() {
        let env = OutboundEnvelope::new("getTree", json!({}));
        assert!(!env.to_json().unwrap().contains("requestId"));
        let tagged = env.with_request_id(7);
        assert!(tagged.to_json().unwrap().contains(r#""requestId":7"#));
    }

    #[test]
    fn inbound_parses_without_payload() {
        let env = InboundEnvelope::parse(r#"{"success":true,"message":"File created successfully"}"#)
            .unwrap();
        assert!(env.success);
        assert_eq!(env.message, tags::FILE_CREATED);
        assert!(env.payload.is_null());
        assert_eq!(env.request_id, None);
    }

    #[test]
    fn inbound_rejects_echoed_request() {
        // The backend echoes raw client frames back; they are not replies.
        let err = InboundEnvelope::parse(r#"{"type":"getFile","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn inbound_rejects_garbage() {
        assert!(InboundEnvelope::parse("not json").is_err());
        assert!(InboundEnvelope::parse("").is_err());
    }

    #[test]
    fn project_type_parses_aliases() {
        assert_eq!("go".parse::<ProjectType>().unwrap(), ProjectType::Golang);
        assert_eq!("C++".parse::<ProjectType>().unwrap(), ProjectType::Cpp);
        assert!("cobol".parse::<ProjectType>().is_err());
        assert_eq!(ProjectType::React.to_string(), "react");
    }

    #[test]
    fn file_tree_lookup() {
        let tree: FileNode = serde_json::from_value(json!({
            "name": "proj",
            "type": "folder",
            "path": "/proj",
            "children": [
                {"name": "main.go", "type": "file", "path": "/proj/main.go"},
                {"name": "pkg", "type": "folder", "path": "/proj/pkg", "children": [
                    {"name": "util.go", "type": "file", "path": "/proj/pkg/util.go"}
                ]}
            ]
        }))
        .unwrap();

        assert!(tree.is_folder());
        assert_eq!(tree.find("/proj/pkg/util.go").unwrap().name, "util.go");
        assert!(tree.find("/proj/missing").is_none());
        assert_eq!(tree.file_paths(), vec!["/proj/main.go", "/proj/pkg/util.go"]);
    }
}
