use async_trait::async_trait;
use dbconv_core::{ConversionConfig, ConversionStatus, FailureReason, ProgressEvent, SourceKind, Stage};
use dbconv_engine::{ConversionHandle, ConversionManager, ManagerError};
use dbconv_env::{CancelToken, EnvError, ExecutionEnvironment, RunOutput, RunRequest, WslEnvironment};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const GIB: u64 = 1 << 30;

#[derive(Debug, Clone, Copy)]
enum Extract {
    Sequences,
    Empty,
    Fail(&'static str),
    /// Blocks until released or cancelled.
    Hold,
}

#[derive(Debug, Clone, Copy)]
enum Build {
    Database,
    Nothing,
    /// Writes a partial index, then blocks until cancelled.
    Hold,
    TimeOut,
}

/// Scripted stand-in for a real execution environment. Paths are host paths.
struct FakeEnv {
    available: bool,
    tools: Vec<&'static str>,
    free_bytes: u64,
    extract: Extract,
    build: Build,
    release: Notify,
    build_started: Notify,
    calls: Mutex<Vec<String>>,
}

impl FakeEnv {
    fn healthy() -> Self {
        Self {
            available: true,
            tools: vec!["blastdbcmd", "mmseqs"],
            free_bytes: 50 * GIB,
            extract: Extract::Sequences,
            build: Build::Database,
            release: Notify::new(),
            build_started: Notify::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_extract(mut self, extract: Extract) -> Self {
        self.extract = extract;
        self
    }

    fn with_build(mut self, build: Build) -> Self {
        self.build = build;
        self
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn runs_of(&self, program: &str) -> usize {
        let prefix = format!("run {program}");
        self.calls()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }
}

fn arg_after<'a>(request: &'a RunRequest, flag: &str) -> &'a str {
    let index = request
        .args
        .iter()
        .position(|arg| arg == flag)
        .expect("flag present");
    &request.args[index + 1]
}

fn write_sequences(path: &str) -> Result<(), EnvError> {
    fs::write(path, ">sp|P69905|HBA_HUMAN\nMVLSPADKTNVKAAWGKVGAHAGEYGAEALERMFLSFPTTK\n")?;
    Ok(())
}

#[async_trait]
impl ExecutionEnvironment for FakeEnv {
    fn name(&self) -> &str {
        "fake"
    }

    async fn available(&self) -> bool {
        self.record("available".to_string());
        self.available
    }

    async fn locate_tool(&self, tool: &str) -> Option<String> {
        self.record(format!("locate {tool}"));
        self.tools
            .iter()
            .any(|known| *known == tool)
            .then(|| format!("/usr/bin/{tool}"))
    }

    fn translate_path(&self, host_path: &Path) -> Result<String, EnvError> {
        if !host_path.is_absolute() {
            return Err(EnvError::PathTranslation {
                path: host_path.to_path_buf(),
                reason: "path is not absolute".to_string(),
            });
        }
        Ok(host_path.to_string_lossy().to_string())
    }

    fn host_path(&self, env_path: &str) -> Option<PathBuf> {
        Some(PathBuf::from(env_path))
    }

    async fn free_bytes(&self, _env_path: &str) -> Result<u64, EnvError> {
        self.record("free_bytes".to_string());
        Ok(self.free_bytes)
    }

    async fn run(&self, request: RunRequest, cancel: &CancelToken) -> Result<RunOutput, EnvError> {
        self.record(format!("run {}", request.display()));
        if request.program == "blastdbcmd" {
            let out = arg_after(&request, "-out");
            match self.extract {
                Extract::Sequences => write_sequences(out)?,
                Extract::Empty => {
                    fs::write(out, b"")?;
                }
                Extract::Fail(stderr) => {
                    return Err(EnvError::ExecutionFailed {
                        exit_code: 2,
                        stderr: stderr.to_string(),
                    })
                }
                Extract::Hold => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EnvError::Cancelled),
                        _ = self.release.notified() => write_sequences(out)?,
                    }
                }
            }
        } else {
            let target = &request.args[2];
            match self.build {
                Build::Database => {
                    for suffix in ["", ".index", ".dbtype", "_h", "_h.index"] {
                        fs::write(format!("{target}{suffix}"), b"mmseqs")?;
                    }
                }
                Build::Nothing => {}
                Build::Hold => {
                    fs::write(format!("{target}.index"), b"partial")?;
                    self.build_started.notify_one();
                    cancel.cancelled().await;
                    return Err(EnvError::Cancelled);
                }
                Build::TimeOut => {
                    return Err(EnvError::Timeout {
                        timeout: Duration::from_secs(3_600),
                    })
                }
            }
        }
        Ok(RunOutput::default())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: ConversionConfig,
    blast_root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let blast_root = dir.path().join("blast_databases");
        fs::create_dir_all(&blast_root).expect("create blast root");
        for name in ["swissprot", "pdbaa", "nr"] {
            for ext in ["pin", "phr", "psq"] {
                fs::write(blast_root.join(format!("{name}.{ext}")), b"blast").expect("write volume");
            }
        }
        let config = ConversionConfig {
            target_root: dir.path().join("mmseqs_databases"),
            progress_interval_ms: 10,
            ..ConversionConfig::default()
        };
        Self {
            _dir: dir,
            config,
            blast_root,
        }
    }

    fn source(&self, name: &str) -> PathBuf {
        self.blast_root.join(name)
    }

    fn manager(&self, env: &Arc<FakeEnv>) -> ConversionManager {
        let env: Arc<dyn ExecutionEnvironment> = env.clone();
        ConversionManager::new(self.config.clone(), env)
    }
}

async fn drain(handle: &mut ConversionHandle) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

async fn wait_for_stage(handle: &mut ConversionHandle, stage: Stage) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = handle.next_event().await {
            if event.stage == stage {
                return;
            }
        }
        panic!("run ended before reaching {stage}");
    })
    .await
    .expect("stage reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn converts_swissprot_end_to_end() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy());
    let manager = fixture.manager(&env);

    let mut handle = manager
        .ensure_converted("swissprot", fixture.source("swissprot"), SourceKind::Catalog)
        .expect("start conversion");
    assert!(!handle.cached());
    let events = drain(&mut handle).await;
    let path = handle.wait().await.expect("conversion succeeds");

    let expected = fixture.config.target_root.join("swissprot");
    assert_eq!(path, expected);
    assert!(expected.exists());
    assert!(!fixture.config.target_root.join(".temp_swissprot").exists());

    let percents: Vec<u8> = events.iter().map(|event| event.percent).collect();
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]), "{percents:?}");
    for milestone in [5, 10, 50, 90, 95, 100] {
        assert!(percents.contains(&milestone), "missing {milestone}% in {percents:?}");
    }
    for event in &events {
        match event.stage {
            Stage::Extracting => assert!((10..=50).contains(&event.percent)),
            Stage::Building => assert!((50..=90).contains(&event.percent)),
            _ => {}
        }
    }
    let last = events.last().expect("events emitted");
    assert_eq!(last.stage, Stage::Done);
    assert_eq!(last.percent, 100);

    let record = manager.status("swissprot");
    assert_eq!(record.status, ConversionStatus::Converted);
    assert_eq!(record.converted_path(), Some(expected.as_path()));
    assert!(record.is_consistent());
    assert!(!manager.is_converting("swissprot"));
    assert_eq!(manager.ready().len(), 1);

    let calls = env.calls();
    let extract = calls
        .iter()
        .find(|call| call.starts_with("run blastdbcmd"))
        .expect("extractor ran");
    assert!(extract.contains("-entry all -out"));
    assert!(extract.ends_with(".temp_swissprot/swissprot.fasta"));
    assert_eq!(env.runs_of("mmseqs createdb"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_share_one_worker() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy().with_extract(Extract::Hold));
    let manager = fixture.manager(&env);

    let mut first = manager
        .ensure_converted("nr", fixture.source("nr"), SourceKind::Catalog)
        .expect("first request");
    let second = manager
        .ensure_converted("nr", fixture.source("nr"), SourceKind::Catalog)
        .expect("second request");
    assert!(manager.is_converting("nr"));

    wait_for_stage(&mut first, Stage::Extracting).await;
    let third = manager.subscribe("nr").expect("live run");
    env.release.notify_one();

    let first = first.wait().await.expect("first outcome");
    let second = second.wait().await.expect("second outcome");
    let third = third.wait().await.expect("third outcome");
    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(env.runs_of("blastdbcmd"), 1);
    assert_eq!(env.runs_of("mmseqs"), 1);
    assert!(manager.subscribe("nr").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn converted_database_is_served_without_touching_the_environment() {
    let fixture = Fixture::new();
    let first_env = Arc::new(FakeEnv::healthy());
    let converted = fixture
        .manager(&first_env)
        .ensure_converted("pdbaa", fixture.source("pdbaa"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect("converted");

    let env = Arc::new(FakeEnv::healthy());
    let manager = fixture.manager(&env);
    let mut handle = manager
        .ensure_converted("pdbaa", fixture.source("pdbaa"), SourceKind::Catalog)
        .expect("cache hit");
    assert!(handle.cached());
    assert!(handle.next_event().await.is_none());
    assert_eq!(handle.wait().await, Ok(converted));
    assert!(env.calls().is_empty());
    assert!(manager.is_converted("pdbaa"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_artifact_triggers_reconversion() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy());
    let manager = fixture.manager(&env);
    let path = manager
        .ensure_converted("swissprot", fixture.source("swissprot"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect("converted");

    assert_eq!(dbconv_engine::remove_artifact(&path), 5);
    assert!(!manager.is_converted("swissprot"));
    assert_eq!(manager.status("swissprot").status, ConversionStatus::NotConverted);
    assert!(manager.ready().is_empty());

    let handle = manager
        .ensure_converted("swissprot", fixture.source("swissprot"), SourceKind::Catalog)
        .expect("restart");
    assert!(!handle.cached());
    assert_eq!(handle.wait().await, Ok(path));
    assert_eq!(env.runs_of("blastdbcmd"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_runs_are_failed_on_reconcile_and_retryable() {
    let fixture = Fixture::new();
    let status_file = fixture.config.status_file_path();
    fs::create_dir_all(status_file.parent().expect("parent")).expect("create root");
    fs::write(
        &status_file,
        format!(
            r#"{{"databases": {{"nr": {{"status": "converting", "source_path": {:?}, "started_at": "2026-01-01T00:00:00Z"}}}}}}"#,
            fixture.source("nr").to_string_lossy()
        ),
    )
    .expect("write crashed status");
    let leftover = fixture.config.target_root.join(".temp_nr");
    fs::create_dir_all(&leftover).expect("create leftover scratch");

    let env = Arc::new(FakeEnv::healthy());
    let manager = fixture.manager(&env);
    let report = manager.reconcile().expect("reconcile");
    assert_eq!(report.interrupted, vec!["nr".to_string()]);
    assert!(report.repaired_paths.is_empty());
    assert!(!leftover.exists());

    let record = manager.status("nr");
    assert_eq!(record.status, ConversionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("interrupted"));
    assert!(manager.reconcile().expect("second pass").is_empty());

    let path = manager
        .retry("nr")
        .expect("retry failed run")
        .wait()
        .await
        .expect("retry converts");
    assert_eq!(path, fixture.config.target_root.join("nr"));
    assert!(matches!(
        manager.retry("nr"),
        Err(ManagerError::NotRetryable {
            status: ConversionStatus::Converted,
            ..
        })
    ));
    assert!(matches!(manager.retry("pdbaa"), Err(ManagerError::UnknownDatabase(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn low_disk_space_fails_before_extraction() {
    let fixture = Fixture::new();
    let mut env = FakeEnv::healthy();
    env.free_bytes = GIB / 2;
    let env = Arc::new(env);
    let manager = fixture.manager(&env);

    let failure = manager
        .ensure_converted("swissprot", fixture.source("swissprot"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect_err("not enough space");
    assert_eq!(failure.reason, FailureReason::InsufficientSpace);
    assert!(failure.message.contains("insufficient disk space"));
    assert_eq!(env.runs_of("blastdbcmd"), 0);

    let record = manager.status("swissprot");
    assert_eq!(record.status, ConversionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some(failure.message.as_str()));
    assert!(record.failed_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn preflight_reports_missing_environment_tools_and_sources() {
    let fixture = Fixture::new();

    let mut offline = FakeEnv::healthy();
    offline.available = false;
    let offline = Arc::new(offline);
    let failure = fixture
        .manager(&offline)
        .ensure_converted("nr", fixture.source("nr"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect_err("offline");
    assert_eq!(failure.reason, FailureReason::EnvironmentUnavailable);

    let mut no_builder = FakeEnv::healthy();
    no_builder.tools = vec!["blastdbcmd"];
    let no_builder = Arc::new(no_builder);
    let failure = fixture
        .manager(&no_builder)
        .ensure_converted("pdbaa", fixture.source("pdbaa"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect_err("builder missing");
    assert_eq!(failure.reason, FailureReason::ToolMissing);
    assert!(failure.message.contains("mmseqs"));

    let env = Arc::new(FakeEnv::healthy());
    let failure = fixture
        .manager(&env)
        .ensure_converted("custom_mydb", fixture.source("mydb"), SourceKind::Custom)
        .expect("start")
        .wait()
        .await
        .expect_err("source missing");
    assert_eq!(failure.reason, FailureReason::SourceMissing);
    assert!(env.calls().iter().all(|call| !call.starts_with("run")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_extraction_leaves_nothing_behind() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy().with_extract(Extract::Hold));
    let manager = fixture.manager(&env);

    let mut handle = manager
        .ensure_converted("swissprot", fixture.source("swissprot"), SourceKind::Catalog)
        .expect("start");
    wait_for_stage(&mut handle, Stage::Extracting).await;
    assert!(manager.cancel("swissprot"));

    let events = drain(&mut handle).await;
    assert_eq!(events.last().map(|event| event.stage), Some(Stage::Cancelled));
    let failure = handle.wait().await.expect_err("cancelled");
    assert_eq!(failure.reason, FailureReason::Cancelled);
    assert_eq!(failure.message, "cancelled");

    let record = manager.status("swissprot");
    assert_eq!(record.status, ConversionStatus::NotConverted);
    assert!(record.error.is_none());
    assert!(!dbconv_engine::artifact_exists(&fixture.config.target_root.join("swissprot")));
    assert!(!fixture.config.target_root.join(".temp_swissprot").exists());
    assert!(!manager.is_converting("swissprot"));
    assert!(!manager.cancel("swissprot"));
    assert_eq!(env.runs_of("mmseqs"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_extraction_never_builds() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy().with_extract(Extract::Empty));
    let manager = fixture.manager(&env);

    let failure = manager
        .ensure_converted("pdbaa", fixture.source("pdbaa"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect_err("empty extraction");
    assert_eq!(failure.reason, FailureReason::EmptyIntermediate);
    assert_eq!(env.runs_of("mmseqs"), 0);
    assert!(!dbconv_engine::artifact_exists(&fixture.config.target_root.join("pdbaa")));
    assert!(!fixture.config.target_root.join(".temp_pdbaa").exists());
    assert_eq!(manager.status("pdbaa").status, ConversionStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn extractor_and_builder_failures_are_classified() {
    let fixture = Fixture::new();
    let env = Arc::new(
        FakeEnv::healthy().with_extract(Extract::Fail("BLAST Database error: No alias or index file found")),
    );
    let failure = fixture
        .manager(&env)
        .ensure_converted("nr", fixture.source("nr"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect_err("extraction fails");
    assert_eq!(failure.reason, FailureReason::ExtractionFailed);
    assert!(failure.message.contains("No alias or index file found"));

    let mut silent = FakeEnv::healthy();
    silent.build = Build::Nothing;
    let silent = Arc::new(silent);
    let stale = fixture.config.target_root.join("swissprot.index");
    fs::create_dir_all(&fixture.config.target_root).expect("create root");
    fs::write(&stale, b"stale").expect("write stale artifact");
    let failure = fixture
        .manager(&silent)
        .ensure_converted("swissprot", fixture.source("swissprot"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect_err("no database produced");
    assert_eq!(failure.reason, FailureReason::BuildFailed);
    assert_eq!(failure.message, "builder produced no database");
    assert!(!stale.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_removes_artifacts_and_resets_status() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy());
    let manager = fixture.manager(&env);
    let path = manager
        .ensure_converted("swissprot", fixture.source("swissprot"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect("converted");

    assert!(manager.cleanup("swissprot").await.expect("cleanup"));
    assert!(!dbconv_engine::artifact_exists(&path));
    assert_eq!(manager.status("swissprot").status, ConversionStatus::NotConverted);
    assert!(!manager.cleanup("unknown").await.expect("cleanup unknown"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_cancels_a_live_run_first() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy().with_extract(Extract::Hold));
    let manager = fixture.manager(&env);
    let mut handle = manager
        .ensure_converted("nr", fixture.source("nr"), SourceKind::Catalog)
        .expect("start");
    wait_for_stage(&mut handle, Stage::Extracting).await;

    assert!(manager.cleanup("nr").await.expect("cleanup"));
    assert!(!manager.is_converting("nr"));
    assert_eq!(
        handle.wait().await.map_err(|failure| failure.reason),
        Err(FailureReason::Cancelled)
    );
    assert_eq!(manager.status("nr").status, ConversionStatus::NotConverted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_database_id_stays_bound_to_its_source() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy());
    let manager = fixture.manager(&env);
    manager
        .ensure_converted("swissprot", fixture.source("swissprot"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect("converted");

    let err = manager
        .ensure_converted("swissprot", fixture.source("pdbaa"), SourceKind::Catalog)
        .expect_err("different source");
    assert!(matches!(err, ManagerError::SourceConflict { .. }));
    assert!(matches!(
        manager.ensure_converted("  ", fixture.source("nr"), SourceKind::Catalog),
        Err(ManagerError::InvalidId)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrency_limit_queues_runs_in_preflight() {
    let mut fixture = Fixture::new();
    fixture.config.max_concurrent = 1;
    let env = Arc::new(FakeEnv::healthy().with_extract(Extract::Hold));
    let manager = fixture.manager(&env);

    let mut running = manager
        .ensure_converted("nr", fixture.source("nr"), SourceKind::Catalog)
        .expect("first run");
    wait_for_stage(&mut running, Stage::Extracting).await;

    let mut queued = manager
        .ensure_converted("pdbaa", fixture.source("pdbaa"), SourceKind::Catalog)
        .expect("second run");
    let waiting = queued.next_event().await.expect("queued event");
    assert_eq!(waiting.stage, Stage::Preflight);
    assert!(waiting.message.contains("Waiting"));
    assert!(manager.is_converting("pdbaa"));

    assert!(manager.cancel("pdbaa"));
    let failure = queued.wait().await.expect_err("cancelled while queued");
    assert_eq!(failure.reason, FailureReason::Cancelled);

    env.release.notify_one();
    running.wait().await.expect("first run completes");
    assert_eq!(env.runs_of("blastdbcmd"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_build_removes_partial_database() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy().with_build(Build::Hold));
    let manager = fixture.manager(&env);
    let target = fixture.config.target_root.join("swissprot");

    let handle = manager
        .ensure_converted("swissprot", fixture.source("swissprot"), SourceKind::Catalog)
        .expect("start");
    tokio::time::timeout(Duration::from_secs(10), env.build_started.notified())
        .await
        .expect("builder started");
    assert!(dbconv_engine::artifact_exists(&target));
    assert!(manager.cancel("swissprot"));

    let failure = handle.wait().await.expect_err("cancelled");
    assert_eq!(failure.reason, FailureReason::Cancelled);
    assert_eq!(manager.status("swissprot").status, ConversionStatus::NotConverted);
    assert!(!dbconv_engine::artifact_exists(&target));
    assert!(!fixture.config.target_root.join(".temp_swissprot").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn builder_timeout_fails_the_run() {
    let fixture = Fixture::new();
    let env = Arc::new(FakeEnv::healthy().with_build(Build::TimeOut));
    let manager = fixture.manager(&env);

    let failure = manager
        .ensure_converted("pdbaa", fixture.source("pdbaa"), SourceKind::Catalog)
        .expect("start")
        .wait()
        .await
        .expect_err("timed out");
    assert_eq!(failure.reason, FailureReason::ExecutionTimeout);
    assert_eq!(failure.message, "tool timed out after 3600s");

    let record = manager.status("pdbaa");
    assert_eq!(record.status, ConversionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("tool timed out after 3600s"));
    assert!(!fixture.config.target_root.join(".temp_pdbaa").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_database_removal_is_reported_while_building() {
    let fixture = Fixture::new();
    fs::create_dir_all(&fixture.config.target_root).expect("create root");
    fs::write(fixture.config.target_root.join("nr.dbtype"), b"stale").expect("write stale");
    let env = Arc::new(FakeEnv::healthy());
    let manager = fixture.manager(&env);

    let mut handle = manager
        .ensure_converted("nr", fixture.source("nr"), SourceKind::Catalog)
        .expect("start");
    let events = drain(&mut handle).await;
    handle.wait().await.expect("converted");
    assert!(events
        .iter()
        .any(|event| event.stage == Stage::Building && event.message == "Removed old database"));
    assert_eq!(
        fs::read(fixture.config.target_root.join("nr.dbtype")).expect("rebuilt"),
        b"mmseqs"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconcile_maps_environment_paths_back_to_host_paths() {
    let fixture = Fixture::new();
    let status_file = fixture.config.status_file_path();
    fs::create_dir_all(status_file.parent().expect("parent")).expect("create root");
    fs::write(
        &status_file,
        r#"{"databases": {"nr": {"status": "converted", "source_path": "E:\\blast_databases\\nr", "converted_path": "/mnt/e/mmseqs_databases/nr", "converted_at": "2026-01-01T00:00:00Z"}}}"#,
    )
    .expect("write status");

    let env: Arc<dyn ExecutionEnvironment> =
        Arc::new(WslEnvironment::with_launcher("dbconv-no-such-launcher"));
    let manager = ConversionManager::new(fixture.config.clone(), env);
    let report = manager.reconcile().expect("reconcile");
    assert_eq!(report.repaired_paths, vec!["nr".to_string()]);
    assert!(report.interrupted.is_empty());

    let record = manager.status("nr");
    assert_eq!(record.status, ConversionStatus::Converted);
    assert_eq!(
        record.converted_path(),
        Some(Path::new(r"E:\mmseqs_databases\nr"))
    );
    assert!(manager.reconcile().expect("second pass").is_empty());
}
