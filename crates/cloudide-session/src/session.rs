use std::sync::Arc;

use cloudide_protocol::{
    DocumentPath, FileNode, InboundEnvelope, ProjectType, WorkspaceId, WorkspaceRequest,
    decode_content,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::debounce::{Debouncer, MutationSink};
use crate::dispatch::Dispatcher;
use crate::error::RequestError;
use crate::terminal::{TerminalHandle, TerminalSession, TerminalSize, TerminalSurface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection has been started.
    Disconnected,
    Connecting,
    Open,
    /// The last connection ended. [`Session::ensure_connected`] starts a new one.
    Closed,
}

type Link = Arc<Mutex<Option<Arc<Dispatcher>>>>;
type ProjectRoot = Arc<Mutex<Option<String>>>;

/// Writes flushed document edits back to the workspace.
pub struct DocumentWriter {
    link: Link,
    root: ProjectRoot,
}

impl MutationSink for DocumentWriter {
    fn flush(&self, path: &str, encoded: String) {
        let root = self.root.lock().clone();
        let doc = DocumentPath::split(path, root.as_deref());
        let request = WorkspaceRequest::UpdateFile {
            file_name: doc.name,
            file_path: doc.dir,
            content: encoded,
        };
        let dispatcher = self.link.lock().clone();
        match dispatcher {
            Some(dispatcher) => {
                dispatcher.send(&request);
            }
            None => warn!(%path, "no workspace connection, document write dropped"),
        }
    }
}

/// Everything one mounted workspace view needs: its connection, event
/// registry, pending document edits and terminal factory.
///
/// Nothing here is global; dropping the session closes its connection and
/// discards pending edits.
pub struct Session {
    workspace_id: WorkspaceId,
    config: ClientConfig,
    bus: EventBus,
    link: Link,
    root: ProjectRoot,
    debouncer: Debouncer<DocumentWriter>,
}

impl Session {
    /// Create the session and start connecting.
    pub fn mount(config: ClientConfig, workspace_id: impl Into<WorkspaceId>) -> Self {
        let link = Link::default();
        let root = ProjectRoot::default();
        let debouncer = Debouncer::new(
            DocumentWriter {
                link: link.clone(),
                root: root.clone(),
            },
            config.debounce(),
        );
        let session = Self {
            workspace_id: workspace_id.into(),
            config,
            bus: EventBus::new(),
            link,
            root,
            debouncer,
        };
        info!(workspace_id = %session.workspace_id, "session mounted");
        session.ensure_connected();
        session
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start a connection unless one is connecting or open. Returns whether
    /// a new connection was started.
    pub fn ensure_connected(&self) -> bool {
        let mut link = self.link.lock();
        if let Some(current) = link.as_ref() {
            if current.connection().state() != ConnectionState::Closed {
                return false;
            }
        }
        let (connection, inbound) =
            Connection::connect(self.config.workspace_url.clone(), self.config.outbound_queue);
        let dispatcher = Dispatcher::start(
            connection,
            inbound,
            self.bus.clone(),
            self.config.timeout_policy(),
            self.config.reply_matching,
        );
        *link = Some(Arc::new(dispatcher));
        debug!(workspace_id = %self.workspace_id, url = %self.config.workspace_url, "workspace connection started");
        true
    }

    pub fn state(&self) -> SessionState {
        match self.dispatcher() {
            None => SessionState::Disconnected,
            Some(dispatcher) => match dispatcher.connection().state() {
                ConnectionState::Connecting => SessionState::Connecting,
                ConnectionState::Open => SessionState::Open,
                ConnectionState::Closed => SessionState::Closed,
            },
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Wait for the current connection to open. `false` if it closed first
    /// or none was started.
    pub async fn wait_ready(&self) -> bool {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.connection().wait_ready().await,
            None => false,
        }
    }

    /// Resolves once the current connection has closed. Immediately when
    /// there is none.
    pub async fn closed(&self) {
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.connection().closed().await;
        }
    }

    /// Discard pending edits, close the connection and drop all
    /// subscriptions. The session can be reconnected with
    /// [`Session::ensure_connected`].
    pub fn unmount(&self) {
        let lost = self.debouncer.discard_all();
        if lost > 0 {
            warn!(workspace_id = %self.workspace_id, lost, "unsaved document edits discarded");
        }
        if let Some(dispatcher) = self.link.lock().take() {
            dispatcher.close();
        }
        self.bus.clear();
        info!(workspace_id = %self.workspace_id, "session unmounted");
    }

    /// Fire-and-forget request. `false` when nothing was written.
    pub fn send_request(&self, kind: &str, payload: Value) -> bool {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.send_request(kind, payload),
            None => {
                warn!(request_type = kind, "no workspace connection, request dropped");
                false
            }
        }
    }

    pub fn send(&self, request: &WorkspaceRequest) -> bool {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.send(request),
            None => {
                warn!(request_type = request.kind(), "no workspace connection, request dropped");
                false
            }
        }
    }

    pub async fn request(&self, request: &WorkspaceRequest) -> Result<InboundEnvelope, RequestError> {
        let dispatcher = self.dispatcher().ok_or(RequestError::NotReady)?;
        dispatcher.request(request).await
    }

    pub fn subscribe<F>(&self, tag: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bus.subscribe(tag, callback)
    }

    pub fn subscribe_once<F>(&self, tag: impl Into<String>, callback: F) -> Subscription
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        self.bus.subscribe_once(tag, callback)
    }

    /// Record a local edit; it is written back after the quiet period.
    pub fn on_document_edit(&self, path: impl Into<String>, content: impl Into<String>) {
        self.debouncer.edit(path, content);
    }

    /// Forget a pending edit for a document being closed.
    pub fn close_document(&self, path: &str) -> bool {
        self.debouncer.discard(path)
    }

    pub fn has_pending_edit(&self, path: &str) -> bool {
        self.debouncer.is_pending(path)
    }

    pub fn project_root(&self) -> Option<String> {
        self.root.lock().clone()
    }

    /// Absolute tree path that document paths are made relative to.
    pub fn set_project_root(&self, root: impl Into<String>) {
        *self.root.lock() = Some(root.into());
    }

    /// Open a terminal on this workspace.
    pub fn attach_terminal<T: TerminalSurface>(
        &self,
        terminal_id: &str,
        surface: T,
        size: TerminalSize,
    ) -> TerminalHandle {
        let url = self.config.terminal_endpoint(&self.workspace_id, terminal_id);
        debug!(workspace_id = %self.workspace_id, %url, "attaching terminal");
        TerminalSession::attach(url, surface, size, self.config.outbound_queue)
    }

    pub async fn init_project(&self, project_type: ProjectType) -> Result<InboundEnvelope, RequestError> {
        self.request(&WorkspaceRequest::InitProject { project_type })
            .await
    }

    /// Fetch the file tree and remember its root path.
    pub async fn get_tree(&self) -> Result<FileNode, RequestError> {
        let reply = self.request(&WorkspaceRequest::GetTree).await?;
        let tree = parse_tree(reply.payload)?;
        self.set_project_root(tree.path.clone());
        Ok(tree)
    }

    /// Fetch a document's text. Content is accepted base64 encoded or plain.
    pub async fn get_file(&self, path: &str) -> Result<String, RequestError> {
        let doc = self.document_path(path);
        let reply = self
            .request(&WorkspaceRequest::GetFile {
                file_name: doc.name,
                file_path: doc.dir,
            })
            .await?;
        let content = reply
            .payload
            .get("content")
            .and_then(Value::as_str)
            .or_else(|| reply.payload.as_str())
            .ok_or_else(|| RequestError::UnexpectedPayload {
                message: "getFile reply has no content".to_string(),
            })?;
        Ok(decode_content(content).unwrap_or_else(|_| content.to_string()))
    }

    pub async fn create_file(&self, path: &str) -> Result<InboundEnvelope, RequestError> {
        let doc = self.document_path(path);
        self.request(&WorkspaceRequest::CreateFile {
            file_name: doc.name,
            file_path: doc.dir,
        })
        .await
    }

    pub async fn create_folder(&self, path: &str) -> Result<InboundEnvelope, RequestError> {
        let doc = self.document_path(path);
        self.request(&WorkspaceRequest::CreateFolder {
            folder_name: doc.name,
            folder_path: doc.dir,
        })
        .await
    }

    pub async fn delete_file(&self, path: &str) -> Result<InboundEnvelope, RequestError> {
        let doc = self.document_path(path);
        self.request(&WorkspaceRequest::DeleteFile {
            file_name: doc.name,
            file_path: doc.dir,
        })
        .await
    }

    pub async fn delete_folder(&self, path: &str) -> Result<InboundEnvelope, RequestError> {
        let doc = self.document_path(path);
        let file_path = if doc.dir.is_empty() {
            doc.name
        } else {
            format!("{}/{}", doc.dir, doc.name)
        };
        self.request(&WorkspaceRequest::DeleteFolder { file_path })
            .await
    }

    fn document_path(&self, path: &str) -> DocumentPath {
        let root = self.root.lock().clone();
        DocumentPath::split(path, root.as_deref())
    }

    fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.link.lock().clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.debouncer.discard_all();
        if let Some(dispatcher) = self.link.lock().take() {
            dispatcher.close();
        }
    }
}

/// The tree arrives either as the payload itself or wrapped in `{"tree": ...}`.
fn parse_tree(payload: Value) -> Result<FileNode, RequestError> {
    let value = match payload {
        Value::Object(mut map) if map.contains_key("tree") => map.remove("tree").unwrap_or_default(),
        other => other,
    };
    serde_json::from_value(value).map_err(|e| RequestError::UnexpectedPayload {
        message: format!("invalid tree: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offline_config() -> ClientConfig {
        // Nothing listens on port 9; connections fail fast.
        ClientConfig {
            workspace_url: "ws://127.0.0.1:9/ws".to_string(),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn tree_payload_shapes() {
        let node = json!({"name": "proj", "type": "folder", "path": "/proj", "children": []});
        assert_eq!(parse_tree(node.clone()).unwrap().path, "/proj");
        assert_eq!(parse_tree(json!({"tree": node})).unwrap().name, "proj");
        assert!(matches!(
            parse_tree(json!({"oops": true})),
            Err(RequestError::UnexpectedPayload { .. })
        ));
    }

    #[tokio::test]
    async fn send_after_connection_failure_is_a_noop() {
        let session = Session::mount(offline_config(), "w1");
        assert!(!session.wait_ready().await);
        assert_eq!(session.state(), SessionState::Closed);

        assert!(!session.send_request("getTree", json!({})));
        assert!(matches!(
            session.request(&WorkspaceRequest::GetTree).await,
            Err(RequestError::NotReady)
        ));
    }

    #[tokio::test]
    async fn unmount_discards_pending_edits_and_disconnects() {
        let session = Session::mount(offline_config(), "w1");
        session.on_document_edit("/proj/a.txt", "draft");
        assert!(session.has_pending_edit("/proj/a.txt"));

        session.unmount();
        assert!(!session.has_pending_edit("/proj/a.txt"));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.send_request("getTree", json!({})));
        session.closed().await;
    }

    #[tokio::test]
    async fn closed_resolves_after_connection_failure() {
        let session = Session::mount(offline_config(), "w1");
        tokio::time::timeout(std::time::Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn ensure_connected_restarts_only_closed_connections() {
        let session = Session::mount(offline_config(), "w1");
        assert!(!session.wait_ready().await);
        assert!(session.ensure_connected());
        // The fresh connection is still connecting or already failed; only
        // a closed one is replaced.
        if session.state() != SessionState::Closed {
            assert!(!session.ensure_connected());
        }
    }

    #[test]
    fn document_writer_without_connection_drops_the_write() {
        let writer = DocumentWriter {
            link: Link::default(),
            root: ProjectRoot::default(),
        };
        writer.flush("/proj/a.txt", "aGVsbG8=".to_string());
    }
}
