use std::sync::Arc;
use std::time::{Duration, Instant};

use sandbox::layout::ENTRYPOINT;
use sandbox::{
    Archive, EnvironmentConfig, EnvironmentGuard, Executor, OutputSender, RawOutput,
    ResourceLimits, RunRequest, SandboxError, StagedFile, WorkspaceEntry,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::ServiceResult;
use crate::storage::FileResolver;
use crate::types::{ExecuteRequest, ExecuteResponse, FileRef, FileSource, WorkspaceFile};

/// Slack on top of timeout and provisioning for staging, extraction and teardown.
const LIFETIME_MARGIN: Duration = Duration::from_secs(90);

/// A request that passed validation and is ready to run.
#[derive(Debug)]
pub struct PreparedRequest {
    id: Uuid,
    archive: Archive,
    stdin: Option<String>,
    timeout: Duration,
}

/// Runs one request end to end in a fresh environment.
///
/// Holds only read-only configuration; every call creates and destroys its
/// own environment.
pub struct ExecutionService {
    executor: Arc<dyn Executor>,
    files: Arc<dyn FileResolver>,
    limits: ResourceLimits,
    max_timeout: Duration,
    provision_timeout: Duration,
}

impl ExecutionService {
    pub fn new(
        config: &ServiceConfig,
        executor: Arc<dyn Executor>,
        files: Arc<dyn FileResolver>,
    ) -> Self {
        Self {
            executor,
            files,
            limits: config.resource_limits(),
            max_timeout: config.max_exec_timeout(),
            provision_timeout: config.provision_timeout(),
        }
    }

    /// Validate, stage, run and harvest one request.
    ///
    /// Everything that can be rejected is rejected before an environment is
    /// created. Once one exists it is destroyed on every exit path, including
    /// this future being dropped.
    pub async fn execute(&self, request: ExecuteRequest) -> ServiceResult<ExecuteResponse> {
        let prepared = self.prepare(request).await?;
        self.run(prepared, None).await
    }

    /// Every check that needs no environment: timeout bounds, file paths and
    /// sources, stored file lookup, and building the staging archive.
    pub async fn prepare(&self, request: ExecuteRequest) -> ServiceResult<PreparedRequest> {
        let timeout = self.validate_timeout(request.timeout_ms)?;
        let files = self.resolve_files(&request.files).await?;
        let code = sandbox::transform(&request.code, request.last_line_interactive);
        let archive = sandbox::stage(&code, &files)?;

        let id = Uuid::new_v4();
        debug!(
            id = %id,
            code_bytes = request.code.len(),
            files = files.len(),
            archive_bytes = archive.len(),
            interactive = request.last_line_interactive,
            "request validated"
        );
        Ok(PreparedRequest {
            id,
            archive,
            stdin: request.stdin,
            timeout,
        })
    }

    /// Run a prepared request in a fresh environment. With `output` set, the
    /// captured output is also forwarded there while the interpreter runs.
    pub async fn run(
        &self,
        prepared: PreparedRequest,
        output: Option<OutputSender>,
    ) -> ServiceResult<ExecuteResponse> {
        let PreparedRequest {
            id,
            archive,
            stdin,
            timeout,
        } = prepared;
        let config = EnvironmentConfig {
            id,
            resources: self.limits.clone(),
            lifetime: timeout + self.provision_timeout + LIFETIME_MARGIN,
        };
        let mut environment = EnvironmentGuard::create(Arc::clone(&self.executor), config).await?;

        let run = RunRequest {
            stdin: stdin.as_deref().map(str::as_bytes),
            timeout,
            output,
        };
        let result = run_in(&mut environment, &archive, &run).await;
        // Closes the output channel before teardown.
        drop(run);
        environment.release().await;
        let (output, duration, entries) = result?;

        info!(
            id = %id,
            exit_code = output.exit_code,
            timed_out = output.timed_out,
            duration_ms = duration.as_millis(),
            files = entries.len(),
            "request finished"
        );

        Ok(ExecuteResponse {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            files: entries.into_iter().map(WorkspaceFile::from).collect(),
        })
    }

    fn validate_timeout(&self, timeout_ms: u64) -> ServiceResult<Duration> {
        let timeout = Duration::from_millis(timeout_ms);
        if timeout.is_zero() {
            return Err(SandboxError::Validation("timeout_ms must be greater than 0".into()).into());
        }
        if timeout > self.max_timeout {
            return Err(SandboxError::Validation(format!(
                "timeout_ms exceeds maximum of {} ms",
                self.max_timeout.as_millis()
            ))
            .into());
        }
        Ok(timeout)
    }

    /// Check every path and source first, then fetch stored content.
    async fn resolve_files(&self, refs: &[FileRef]) -> ServiceResult<Vec<StagedFile>> {
        let mut sources = Vec::with_capacity(refs.len());
        for file in refs {
            sandbox::validate_relative_path(&file.path)?;
            sources.push(file.source().map_err(SandboxError::Validation)?);
        }

        let mut staged = Vec::with_capacity(refs.len());
        for (file, source) in refs.iter().zip(sources) {
            let content = match source {
                FileSource::Inline(bytes) => bytes.to_vec(),
                FileSource::Stored(file_id) => self.files.resolve(file_id, &file.path).await?,
            };
            staged.push(StagedFile::new(file.path.clone(), content));
        }
        Ok(staged)
    }
}

/// Stage, run and extract inside an environment the caller owns.
///
/// The reported duration covers staging and running only. A failed
/// extraction is logged and yields no files, since the run's output is still
/// worth returning.
async fn run_in(
    environment: &mut EnvironmentGuard,
    archive: &Archive,
    run: &RunRequest<'_>,
) -> sandbox::Result<(RawOutput, Duration, Vec<WorkspaceEntry>)> {
    let started = Instant::now();
    environment.stage(archive).await?;
    let staging = started.elapsed();
    let output = environment.run(run).await?;
    let duration = staging + output.duration;

    let entries = environment
        .extract(&[ENTRYPOINT])
        .await
        .and_then(|workspace| sandbox::entries_from_archive(&workspace, &[ENTRYPOINT]));
    let entries = entries.unwrap_or_else(|e| {
        warn!(id = environment.id().unwrap_or_default(), error = %e, "workspace extraction failed");
        Vec::new()
    });
    Ok((output, duration, entries))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use sandbox::{LifecycleState, TRUNCATION_MARKER};

    use super::*;
    use crate::error::ServiceError;
    use crate::storage::LocalFileStore;
    use crate::testing::{FakeExecutor, Script};

    fn service(executor: &Arc<FakeExecutor>, store: &tempfile::TempDir) -> ExecutionService {
        ExecutionService::new(
            &ServiceConfig::default(),
            Arc::clone(executor) as Arc<dyn Executor>,
            Arc::new(LocalFileStore::new(store.path().to_path_buf())),
        )
    }

    fn request(code: &str) -> ExecuteRequest {
        ExecuteRequest {
            code: code.into(),
            stdin: None,
            timeout_ms: 2000,
            last_line_interactive: true,
            files: Vec::new(),
        }
    }

    fn inline(path: &str, content: &[u8]) -> FileRef {
        FileRef {
            path: path.into(),
            content: Some(content.to_vec()),
            file_id: None,
        }
    }

    #[tokio::test]
    async fn successful_run_is_destroyed_once() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let response = service(&executor, &store)
            .execute(request("print('hi')"))
            .await
            .unwrap();

        assert_eq!(response.exit_code, 0);
        assert!(!response.timed_out);
        assert_eq!(executor.created.load(Ordering::SeqCst), 1);
        assert_eq!(executor.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(executor.final_states(), [LifecycleState::Extracted]);
    }

    #[tokio::test]
    async fn failed_run_is_still_destroyed_once() {
        let executor = Arc::new(FakeExecutor::new(Script::FailRun));
        let store = tempfile::tempdir().unwrap();
        let err = service(&executor, &store)
            .execute(request("print('hi')"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Sandbox(SandboxError::Exec(_))), "{err}");
        assert_eq!(executor.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(executor.final_states(), [LifecycleState::RunFailed]);
    }

    #[tokio::test]
    async fn timed_out_run_is_reported_and_destroyed_once() {
        let executor = Arc::new(FakeExecutor::new(Script::TimeOut));
        let store = tempfile::tempdir().unwrap();
        let response = service(&executor, &store)
            .execute(request("while True: pass"))
            .await
            .unwrap();

        assert!(response.timed_out);
        assert_eq!(response.exit_code, sandbox::KILLED_EXIT_CODE);
        assert_eq!(executor.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_staging_is_destroyed_once() {
        let executor = Arc::new(FakeExecutor::new(Script::FailStage));
        let store = tempfile::tempdir().unwrap();
        let err = service(&executor, &store)
            .execute(request("1"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Sandbox(SandboxError::Staging(_))), "{err}");
        assert_eq!(executor.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_extraction_still_returns_output() {
        let executor = Arc::new(FakeExecutor::new(Script::FailExtract));
        let store = tempfile::tempdir().unwrap();
        let response = service(&executor, &store)
            .execute(request("print('hi')"))
            .await
            .unwrap();

        assert_eq!(response.stdout, "ran\n");
        assert!(response.files.is_empty());
        assert_eq!(executor.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provisioning_failure_has_nothing_to_destroy() {
        let executor = Arc::new(FakeExecutor::new(Script::FailCreate));
        let store = tempfile::tempdir().unwrap();
        let err = service(&executor, &store)
            .execute(request("1"))
            .await
            .unwrap_err();

        assert_eq!(err.status().as_u16(), 503);
        assert_eq!(executor.destroyed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_request_is_destroyed_in_background() {
        let executor = Arc::new(FakeExecutor::new(Script::Hang));
        let store = tempfile::tempdir().unwrap();
        let service = service(&executor, &store);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), service.execute(request("1"))).await;
        assert!(cancelled.is_err());

        tokio::time::timeout(Duration::from_secs(5), executor.notify.notified())
            .await
            .unwrap();
        assert_eq!(executor.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_paths_never_create_an_environment() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let service = service(&executor, &store);

        for path in ["../x", "/x", "", "__main__.py", "a/../../x"] {
            let mut req = request("1");
            req.files = vec![inline("ok.txt", b"fine"), inline(path, b"data")];
            let err = service.execute(req).await.unwrap_err();
            assert!(
                matches!(err, ServiceError::Sandbox(SandboxError::Validation(_))),
                "{path:?}: {err}"
            );
        }
        assert_eq!(executor.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_paths_are_rejected_before_create() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let mut req = request("1");
        req.files = vec![inline("a/b.txt", b"1"), inline("a//b.txt", b"2")];

        let err = service(&executor, &store).execute(req).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 422);
        assert_eq!(executor.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_must_be_within_bounds() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let service = service(&executor, &store);

        for timeout_ms in [0, 60_001] {
            let mut req = request("1");
            req.timeout_ms = timeout_ms;
            let err = service.execute(req).await.unwrap_err();
            assert_eq!(err.status().as_u16(), 422, "{timeout_ms}");
        }
        let mut req = request("1");
        req.timeout_ms = 60_000;
        assert!(service.execute(req).await.is_ok());
        assert_eq!(executor.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_file_id_is_not_found() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let mut req = request("1");
        req.files = vec![FileRef {
            path: "data.csv".into(),
            content: None,
            file_id: Some(Uuid::new_v4()),
        }];

        let err = service(&executor, &store).execute(req).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 404);
        assert_eq!(executor.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn staged_archive_carries_transformed_code_and_files() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let stored_id = Uuid::new_v4();
        tokio::fs::write(store.path().join(stored_id.to_string()), b"stored")
            .await
            .unwrap();

        let mut req = request("print('Hello, World!')\n2 + 2");
        req.files = vec![
            inline("inline.txt", b"inline"),
            FileRef {
                path: "data/stored.bin".into(),
                content: None,
                file_id: Some(stored_id),
            },
        ];
        service(&executor, &store).execute(req).await.unwrap();

        let staged = executor.staged_archives();
        let entries = sandbox::entries_from_archive(&staged[0], &[]).unwrap();
        let content = |path: &str| {
            entries
                .iter()
                .find(|e| e.path == path)
                .and_then(|e| e.content.clone())
        };
        let entrypoint = sandbox::transform("print('Hello, World!')\n2 + 2", true);
        assert_eq!(content(ENTRYPOINT), Some(entrypoint.into_bytes()));
        assert_eq!(content("inline.txt"), Some(b"inline".to_vec()));
        assert_eq!(content("data/stored.bin"), Some(b"stored".to_vec()));
    }

    #[tokio::test]
    async fn non_interactive_code_is_staged_verbatim() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let mut req = request("print('Hello, World!')\n2 + 2");
        req.last_line_interactive = false;
        service(&executor, &store).execute(req).await.unwrap();

        let staged = executor.staged_archives();
        let entries = sandbox::entries_from_archive(&staged[0], &[]).unwrap();
        let entrypoint = entries.iter().find(|e| e.path == ENTRYPOINT).unwrap();
        assert_eq!(
            entrypoint.content.as_deref(),
            Some(b"print('Hello, World!')\n2 + 2".as_slice())
        );
    }

    #[tokio::test]
    async fn concurrent_requests_see_only_their_own_files() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let service = service(&executor, &store);

        let mut first = request("open('out.txt', 'w').write('first')");
        first.files = vec![inline("seed.txt", b"first")];
        let mut second = request("open('out.txt', 'w').write('second')");
        second.files = vec![inline("seed.txt", b"second")];

        let (first, second) = tokio::join!(service.execute(first), service.execute(second));
        let (first, second) = (first.unwrap(), second.unwrap());

        let out = |response: &ExecuteResponse| {
            response
                .files
                .iter()
                .find(|f| f.path == "out.txt")
                .and_then(|f| f.content.clone())
        };
        assert_eq!(out(&first), Some(b"first".to_vec()));
        assert_eq!(out(&second), Some(b"second".to_vec()));
        assert_eq!(executor.created.load(Ordering::SeqCst), 2);
        assert_eq!(executor.destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_forwards_output_while_running() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let service = service(&executor, &store);

        let prepared = service.prepare(request("print('hi')")).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let response = service.run(prepared, Some(tx)).await.unwrap();

        let mut streamed = Vec::new();
        while let Some(chunk) = rx.recv().await {
            assert_eq!(chunk.stream, sandbox::OutputStream::Stdout);
            streamed.extend(chunk.data);
        }
        assert_eq!(streamed, response.stdout.as_bytes());
        assert_eq!(executor.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prepare_never_creates_an_environment() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let service = service(&executor, &store);

        service.prepare(request("1")).await.unwrap();
        let mut bad = request("1");
        bad.timeout_ms = 0;
        assert!(service.prepare(bad).await.is_err());
        assert_eq!(executor.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn entrypoint_is_never_returned() {
        let executor = Arc::new(FakeExecutor::new(Script::Succeed));
        let store = tempfile::tempdir().unwrap();
        let response = service(&executor, &store)
            .execute(request("1"))
            .await
            .unwrap();
        assert!(response.files.iter().all(|f| f.path != ENTRYPOINT));
    }

    #[tokio::test]
    async fn output_is_decoded_lossily() {
        let executor = Arc::new(FakeExecutor::new(Script::Output {
            stdout: b"ok \xff".to_vec(),
            stderr: [b"err".as_slice(), TRUNCATION_MARKER].concat(),
        }));
        let store = tempfile::tempdir().unwrap();
        let response = service(&executor, &store)
            .execute(request("1"))
            .await
            .unwrap();
        assert_eq!(response.stdout, "ok \u{fffd}");
        assert!(response.stderr.ends_with("...[truncated]"));
    }
}
