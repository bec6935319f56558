//! Scripted executor for service and HTTP tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::layout::ENTRYPOINT;
use sandbox::{
    Archive, EntryKind, Environment, EnvironmentConfig, Executor, KILLED_EXIT_CODE, Lifecycle,
    LifecycleState, OutputChunk, OutputStream, RawOutput, RunRequest, SandboxError, StagedFile,
};
use tokio::sync::Notify;

/// How every environment of a [`FakeExecutor`] behaves.
#[derive(Clone)]
pub enum Script {
    /// Prints `ran`, copies `seed.txt` (if staged) to `out.txt`, exits 0.
    Succeed,
    Output { stdout: Vec<u8>, stderr: Vec<u8> },
    FailCreate,
    FailStage,
    FailRun,
    FailExtract,
    TimeOut,
    /// `run` never returns.
    Hang,
}

#[derive(Default)]
struct Record {
    staged: Mutex<Vec<Archive>>,
}

pub struct FakeExecutor {
    script: Script,
    record: Arc<Record>,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub notify: Notify,
    final_states: Mutex<Vec<LifecycleState>>,
}

impl FakeExecutor {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            record: Arc::default(),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            notify: Notify::new(),
            final_states: Mutex::new(Vec::new()),
        }
    }

    pub fn staged_archives(&self) -> Vec<Archive> {
        self.record.staged.lock().unwrap().clone()
    }

    /// State of each environment when it reached `destroy`.
    pub fn final_states(&self) -> Vec<LifecycleState> {
        self.final_states.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        "fake"
    }

    async fn startup(&self) -> sandbox::Result<()> {
        Ok(())
    }

    async fn sweep_stale(&self) -> sandbox::Result<usize> {
        Ok(0)
    }

    async fn create(&self, config: EnvironmentConfig) -> sandbox::Result<Box<dyn Environment>> {
        if matches!(self.script, Script::FailCreate) {
            return Err(SandboxError::Provisioning("never became ready".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEnvironment {
            id: config.id.to_string(),
            script: self.script.clone(),
            record: Arc::clone(&self.record),
            lifecycle: Lifecycle::new(),
            entrypoint: String::new(),
            workspace: Vec::new(),
        }))
    }

    async fn destroy(&self, environment: Box<dyn Environment>) {
        self.final_states.lock().unwrap().push(environment.state());
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

struct FakeEnvironment {
    id: String,
    script: Script,
    record: Arc<Record>,
    lifecycle: Lifecycle,
    entrypoint: String,
    workspace: Vec<StagedFile>,
}

fn output(stdout: &[u8], stderr: &[u8], exit_code: i32, timed_out: bool) -> RawOutput {
    RawOutput {
        stdout: stdout.to_vec(),
        stderr: stderr.to_vec(),
        exit_code,
        timed_out,
        duration: Duration::from_millis(5),
    }
}

impl FakeEnvironment {
    async fn scripted_run(&mut self, request: &RunRequest<'_>) -> sandbox::Result<RawOutput> {
        match self.script.clone() {
            Script::Succeed | Script::FailExtract => {
                let seed = self
                    .workspace
                    .iter()
                    .find(|f| f.path == "seed.txt")
                    .map(|f| f.content.clone());
                if let Some(seed) = seed {
                    self.workspace.push(StagedFile::new("out.txt", seed));
                }
                self.lifecycle.advance(LifecycleState::Completed)?;
                Ok(output(b"ran\n", b"", 0, false))
            }
            Script::Output { stdout, stderr } => {
                self.lifecycle.advance(LifecycleState::Completed)?;
                Ok(output(&stdout, &stderr, 0, false))
            }
            Script::TimeOut => {
                self.lifecycle.advance(LifecycleState::TimedOut)?;
                let mut raw = output(b"", b"", KILLED_EXIT_CODE, true);
                raw.duration = request.timeout;
                Ok(raw)
            }
            Script::Hang => std::future::pending().await,
            Script::FailCreate | Script::FailStage | Script::FailRun => {
                self.lifecycle.advance(LifecycleState::RunFailed)?;
                Err(SandboxError::Exec("exec stream closed without a status".into()))
            }
        }
    }
}

#[async_trait]
impl Environment for FakeEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    async fn stage(&mut self, archive: &Archive) -> sandbox::Result<()> {
        self.lifecycle.ensure(LifecycleState::Staged)?;
        if matches!(self.script, Script::FailStage) {
            return Err(SandboxError::Staging("tar exited with 2".into()));
        }
        self.record.staged.lock().unwrap().push(archive.clone());
        for entry in sandbox::entries_from_archive(archive, &[])? {
            if entry.kind != EntryKind::File {
                continue;
            }
            let content = entry.content.unwrap_or_default();
            if entry.path == ENTRYPOINT {
                self.entrypoint = String::from_utf8(content).unwrap();
            } else {
                self.workspace.push(StagedFile::new(entry.path, content));
            }
        }
        self.lifecycle.advance(LifecycleState::Staged)
    }

    async fn run(&mut self, request: &RunRequest<'_>) -> sandbox::Result<RawOutput> {
        self.lifecycle.advance(LifecycleState::Running)?;
        let result = self.scripted_run(request).await;
        if let (Ok(raw), Some(sender)) = (&result, &request.output) {
            for (stream, data) in [
                (OutputStream::Stdout, &raw.stdout),
                (OutputStream::Stderr, &raw.stderr),
            ] {
                if !data.is_empty() {
                    let _ = sender.send(OutputChunk {
                        stream,
                        data: data.clone(),
                    });
                }
            }
        }
        result
    }

    async fn extract(&mut self, exclude: &[&str]) -> sandbox::Result<Archive> {
        self.lifecycle.ensure(LifecycleState::Extracted)?;
        if matches!(self.script, Script::FailExtract) {
            return Err(SandboxError::Extraction("tar exited with 1".into()));
        }
        let archive = sandbox::stage(&self.entrypoint, &self.workspace)?;
        let archive = sandbox::exclude_members(&archive, exclude)?;
        self.lifecycle.advance(LifecycleState::Extracted)?;
        Ok(archive)
    }
}
