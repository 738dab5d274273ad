//! Testing utilities for the Sciflow workspace
//!
//! In-memory sandbox backend, scripted code generators and dataset fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sciflow_core::{CodeGenerator, Dataset, GenerationError};
use sciflow_sandbox::{
    BackendHandle, ExecOutput, OwnerLabel, ResourceLimits, SandboxBackend, SandboxError,
};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the mock saw for one `exec` call
#[derive(Debug, Clone)]
pub struct MockExec {
    pub handle: BackendHandle,
    pub files: BTreeMap<String, Vec<u8>>,
    pub argv: Vec<String>,
}

impl MockExec {
    pub fn file_text(&self, path: &str) -> String {
        self.files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    /// The wrapped script injected at `/tmp/executor.py`
    pub fn script(&self) -> String {
        self.file_text(sciflow_sandbox::protocol::SCRIPT_PATH)
    }
}

pub type Responder = Arc<dyn Fn(&MockExec) -> ExecOutput + Send + Sync>;

#[derive(Debug, Default)]
struct MockContainer {
    labels: Vec<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: usize,
    live: BTreeMap<String, MockContainer>,
    removed: Vec<String>,
    created: usize,
    fail_creates: usize,
    execs: usize,
}

/// In-memory stand-in for a container runtime
///
/// By default a script containing `raise` fails with
/// `Error executing code: boom`; anything else prints `ok`.
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    reachable: Arc<AtomicBool>,
    exec_delay: Option<Duration>,
    responder: Responder,
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBackend")
            .field("state", &self.state)
            .field("reachable", &self.reachable)
            .field("exec_delay", &self.exec_delay)
            .finish_non_exhaustive()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            reachable: Arc::new(AtomicBool::new(true)),
            exec_delay: None,
            responder: Arc::new(default_responder),
        }
    }

    /// Backend whose daemon cannot be reached
    pub fn unreachable() -> Self {
        let backend = Self::new();
        backend.set_reachable(false);
        backend
    }

    /// Take the daemon down or bring it back; shared by every clone
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&MockExec) -> ExecOutput + Send + Sync + 'static,
    {
        self.responder = Arc::new(f);
        self
    }

    /// Make every exec take `delay`
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// Pretend a previous process left a labeled container behind
    pub fn seed_orphan(&self, label: &OwnerLabel) -> BackendHandle {
        let mut state = self.state.lock();
        let id = format!("orphan-{}", state.next_id);
        state.next_id += 1;
        state.live.insert(
            id.clone(),
            MockContainer {
                labels: vec![label.to_string()],
                files: BTreeMap::new(),
            },
        );
        BackendHandle::new(id)
    }

    /// Refuse the next `n` create calls
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().fail_creates = n;
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_live(&self, handle: &BackendHandle) -> bool {
        self.state.lock().live.contains_key(handle.as_str())
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().created
    }

    pub fn exec_count(&self) -> usize {
        self.state.lock().execs
    }

    fn check_reachable(&self) -> Result<(), SandboxError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SandboxError::Unavailable("mock daemon not running".into()))
        }
    }
}

fn default_responder(exec: &MockExec) -> ExecOutput {
    if exec.script().contains("raise") {
        ExecOutput::stderr("Error executing code: boom")
    } else {
        ExecOutput::stdout("ok")
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        self.check_reachable()
    }

    async fn list_labeled(&self, label: &OwnerLabel) -> Result<Vec<BackendHandle>, SandboxError> {
        self.check_reachable()?;
        let wanted = label.to_string();
        Ok(self
            .state
            .lock()
            .live
            .iter()
            .filter(|(_, c)| c.labels.contains(&wanted))
            .map(|(id, _)| BackendHandle::new(id.clone()))
            .collect())
    }

    async fn create(
        &self,
        _limits: &ResourceLimits,
        label: &OwnerLabel,
    ) -> Result<BackendHandle, SandboxError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(SandboxError::CreationFailed("mock refused create".into()));
        }
        let id = format!("mock-{}", state.next_id);
        state.next_id += 1;
        state.created += 1;
        state.live.insert(
            id.clone(),
            MockContainer {
                labels: vec![label.to_string()],
                files: BTreeMap::new(),
            },
        );
        Ok(BackendHandle::new(id))
    }

    async fn put_file(
        &self,
        handle: &BackendHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        let container = state
            .live
            .get_mut(handle.as_str())
            .ok_or_else(|| SandboxError::Backend(format!("no such container {handle}")))?;
        container.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn exec(&self, handle: &BackendHandle, argv: &[&str]) -> Result<ExecOutput, SandboxError> {
        self.check_reachable()?;
        let seen = {
            let mut state = self.state.lock();
            state.execs += 1;
            let container = state
                .live
                .get(handle.as_str())
                .ok_or_else(|| SandboxError::Backend(format!("no such container {handle}")))?;
            MockExec {
                handle: handle.clone(),
                files: container.files.clone(),
                argv: argv.iter().map(|a| (*a).to_string()).collect(),
            }
        };
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        Ok((self.responder)(&seen))
    }

    async fn remove(&self, handle: &BackendHandle) -> Result<(), SandboxError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if state.live.remove(handle.as_str()).is_some() {
            state.removed.push(handle.as_str().to_string());
        }
        Ok(())
    }
}

/// Responder that sums column `A` of the injected CSV, like `print(df['A'].sum())`
pub fn summing_responder(exec: &MockExec) -> ExecOutput {
    let csv = exec.file_text(sciflow_sandbox::protocol::DATASET_PATH);
    let mut lines = csv.lines();
    let Some(header) = lines.next() else {
        return ExecOutput::stderr("Error executing code: empty dataset");
    };
    let Some(col) = header.split(',').position(|h| h == "A") else {
        return ExecOutput::stderr("Error executing code: 'A'");
    };
    let sum: i64 = lines
        .filter_map(|l| l.split(',').nth(col))
        .filter_map(|v| v.trim().parse::<i64>().ok())
        .sum();
    ExecOutput::stdout(format!("{sum}\n"))
}

/// Generator that replays canned responses, repeating the last one
#[derive(Debug)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            last: Mutex::new(String::new()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Take `delay` before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fails `k` times (script raises) and then returns clean code
    pub fn failing_then_ok(k: usize) -> Self {
        let mut responses = vec!["```python\nraise ValueError('boom')\n```".to_string(); k];
        responses.push("```python\nprint(df['A'].mean())\n```".to_string());
        Self::new(responses)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(next) = next {
            *last = next;
        }
        Ok(last.clone())
    }
}

/// Generator whose model is always unreachable
#[derive(Debug, Default)]
pub struct FailingGenerator {
    calls: AtomicUsize,
}

impl FailingGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeGenerator for FailingGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(GenerationError::Unavailable("connection refused".into()))
    }
}

/// `{A: [1, 2, 3]}`
pub fn dataset_a() -> Dataset {
    Dataset::new(
        vec!["A".to_string()],
        vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]],
    )
    .expect("fixture dataset is rectangular")
}

/// Small two-column dataset for prompts and reviews
pub fn dataset_scores() -> Dataset {
    Dataset::new(
        vec!["group".to_string(), "score".to_string()],
        vec![
            vec![json!("a"), json!(1.5)],
            vec![json!("a"), json!(2.5)],
            vec![json!("b"), json!(3.0)],
            vec![json!("b"), json!(4.0)],
        ],
    )
    .expect("fixture dataset is rectangular")
}
