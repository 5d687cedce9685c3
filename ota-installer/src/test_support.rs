// Shared fixtures for unit tests: a canned HTTP server, archive builder and in-memory collaborators.

use crate::download::Credentials;
use crate::error::InstallError;
use crate::installer::{InstallHandle, InstallListener, InstallPhase, InstallState};
use crate::notifier::{OtaNotifier, OtaStatus};
use crate::storage::{
    CommitRequest, InstalledSuite, StorageError, SuiteId, SuiteLookup, SuiteStorage,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct CannedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl CannedResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok(content_type: &str, body: &[u8]) -> Self {
        Self::status(200).header("Content-Type", content_type).body(body)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = write!(out, "HTTP/1.1 {} Canned\r\n", self.status);
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        let _ = write!(
            out,
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        );
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

type Routes = Arc<Mutex<HashMap<String, VecDeque<CannedResponse>>>>;

/// One-connection-per-request HTTP/1.1 server on the loopback interface.
///
/// Each path serves its responses in order; the last one repeats. Unknown paths get 404.
pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(routes: Vec<(&str, Vec<CannedResponse>)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Routes = Arc::new(Mutex::new(
            routes
                .into_iter()
                .map(|(path, responses)| (path.to_string(), responses.into_iter().collect()))
                .collect(),
        ));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = routes.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, routes, requests).await;
                    });
                }
            })
        };

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    routes: Routes,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or("/").to_string();
    let path = target.split('?').next().unwrap_or("/").to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    requests.lock().unwrap().push(RecordedRequest {
        method,
        path: path.clone(),
        headers,
        body,
    });

    let response = {
        let mut routes = routes.lock().unwrap();
        match routes.get_mut(&path) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
        .unwrap_or_else(|| CannedResponse::status(404))
    };
    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await
}

/// Zip archive with `manifest` as `META-INF/MANIFEST.MF` plus an empty entry per path in `entries`.
pub fn build_jar(manifest: &str, entries: &[&str]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default();
        zip.start_file("META-INF/MANIFEST.MF", options).unwrap();
        zip.write_all(manifest.as_bytes()).unwrap();
        for entry in entries {
            zip.start_file(*entry, options).unwrap();
            zip.write_all(b"\xca\xfe\xba\xbe").unwrap();
        }
        zip.finish().unwrap();
    }
    cursor.into_inner()
}

#[derive(Default)]
struct MemoryState {
    suites: HashMap<SuiteId, InstalledSuite>,
    corrupted: HashSet<SuiteId>,
    record_stores: HashSet<SuiteId>,
    commits: Vec<CommitRecord>,
}

/// What a commit carried, minus the temp file (removed by the installer afterwards).
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub suite: InstalledSuite,
    pub archive: Vec<u8>,
    pub discard_record_stores: bool,
}

/// In-memory `SuiteStorage` with a real temp directory for downloads.
pub struct MemoryStorage {
    temp: tempfile::TempDir,
    free_space: Mutex<u64>,
    fail_commit: Mutex<bool>,
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().unwrap(),
            free_space: Mutex::new(u64::MAX / 2),
            fail_commit: Mutex::new(false),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn set_free_space(&self, bytes: u64) {
        *self.free_space.lock().unwrap() = bytes;
    }

    pub fn fail_commits(&self) {
        *self.fail_commit.lock().unwrap() = true;
    }

    pub fn insert(&self, suite: InstalledSuite, has_records: bool) {
        let mut state = self.state.lock().unwrap();
        if has_records {
            state.record_stores.insert(suite.id.clone());
        }
        state.suites.insert(suite.id.clone(), suite);
    }

    pub fn mark_corrupted(&self, id: SuiteId) {
        self.state.lock().unwrap().corrupted.insert(id);
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Files left in the download directory.
    pub fn temp_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.temp.path())
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect()
    }
}

#[async_trait]
impl SuiteStorage for MemoryStorage {
    async fn lookup(&self, id: &SuiteId) -> Result<SuiteLookup, StorageError> {
        let state = self.state.lock().unwrap();
        if state.corrupted.contains(id) {
            return Ok(SuiteLookup::Corrupted(id.clone()));
        }
        Ok(match state.suites.get(id) {
            Some(suite) => SuiteLookup::Found(Box::new(suite.clone())),
            None => SuiteLookup::NotFound,
        })
    }

    async fn free_space_bytes(&self) -> Result<u64, StorageError> {
        Ok(*self.free_space.lock().unwrap())
    }

    fn temp_dir(&self) -> PathBuf {
        self.temp.path().to_path_buf()
    }

    async fn has_record_stores(&self, id: &SuiteId) -> Result<bool, StorageError> {
        Ok(self.state.lock().unwrap().record_stores.contains(id))
    }

    async fn commit_suite(&self, request: CommitRequest) -> Result<(), StorageError> {
        if *self.fail_commit.lock().unwrap() {
            return Err(StorageError::Backend(anyhow::anyhow!("disk on fire")));
        }
        let archive = tokio::fs::read(&request.archive_source)
            .await
            .map_err(anyhow::Error::from)?;
        let mut state = self.state.lock().unwrap();
        let id = request.suite.id.clone();
        if request.discard_record_stores {
            state.record_stores.remove(&id);
        }
        state.corrupted.remove(&id);
        state.suites.insert(id, request.suite.clone());
        state.commits.push(CommitRecord {
            suite: request.suite,
            archive,
            discard_record_stores: request.discard_record_stores,
        });
        Ok(())
    }

    async fn list_suites(&self) -> Result<Vec<InstalledSuite>, StorageError> {
        Ok(self.state.lock().unwrap().suites.values().cloned().collect())
    }
}

/// Listener callbacks as recorded by `RecordingListener`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Phase(String),
    Warning(crate::error::InstallErrorKind),
    ConfirmDownload,
    ConfirmAuthPath(Vec<String>),
    KeepRms,
    Credentials { proxy: bool },
}

/// Scripted listener: fixed answers, every callback logged.
pub struct RecordingListener {
    pub approve_warnings: bool,
    pub approve_download: bool,
    pub approve_auth_path: bool,
    pub keep_rms: bool,
    pub credentials: Option<Credentials>,
    /// Stopped from inside `confirm_archive_download`.
    pub stop_during_confirm: Option<InstallHandle>,
    stop_result: Mutex<Option<bool>>,
    events: Mutex<Vec<ListenerEvent>>,
    steps_at_warning: Mutex<Vec<u8>>,
}

impl RecordingListener {
    pub fn approving() -> Self {
        Self {
            approve_warnings: true,
            approve_download: true,
            approve_auth_path: true,
            keep_rms: true,
            credentials: None,
            stop_during_confirm: None,
            stop_result: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            steps_at_warning: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<crate::error::InstallErrorKind> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ListenerEvent::Warning(kind) => Some(kind),
                _ => None,
            })
            .collect()
    }

    /// Step number current at each warning, in order.
    pub fn steps_at_warning(&self) -> Vec<u8> {
        self.steps_at_warning.lock().unwrap().clone()
    }

    /// What `stop()` returned when called during confirmation.
    pub fn stop_result(&self) -> Option<bool> {
        *self.stop_result.lock().unwrap()
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl InstallListener for RecordingListener {
    async fn update_status(&self, phase: InstallPhase, _state: &InstallState) {
        let label = match phase {
            InstallPhase::DescriptorProgress { .. } | InstallPhase::ArchiveProgress { .. } => {
                return
            }
            other => format!("{:?}", other),
        };
        self.record(ListenerEvent::Phase(label));
    }

    async fn warn_user(&self, state: &InstallState, warning: &InstallError) -> bool {
        self.steps_at_warning
            .lock()
            .unwrap()
            .push(state.current_step.number());
        self.record(ListenerEvent::Warning(warning.kind()));
        self.approve_warnings
    }

    async fn confirm_archive_download(&self, _state: &InstallState) -> bool {
        self.record(ListenerEvent::ConfirmDownload);
        if let Some(handle) = &self.stop_during_confirm {
            *self.stop_result.lock().unwrap() = Some(handle.stop());
        }
        self.approve_download
    }

    async fn confirm_auth_path(&self, state: &InstallState) -> bool {
        self.record(ListenerEvent::ConfirmAuthPath(state.auth_path.clone()));
        self.approve_auth_path
    }

    async fn keep_rms_data(&self, _state: &InstallState) -> bool {
        self.record(ListenerEvent::KeepRms);
        self.keep_rms
    }

    async fn credentials(&self, _state: &InstallState, proxy: bool) -> Option<Credentials> {
        self.record(ListenerEvent::Credentials { proxy });
        self.credentials.clone()
    }
}

/// Collects status reports instead of sending them.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, OtaStatus)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, OtaStatus)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl OtaNotifier for RecordingNotifier {
    async fn notify(&self, url: &str, status: OtaStatus, _proxy: Option<&Credentials>) {
        self.sent.lock().unwrap().push((url.to_string(), status));
    }
}
