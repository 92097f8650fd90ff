use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::rstest;
use tokio_util::sync::CancellationToken;

use super::{
    DEFAULT_WARMUP_DELAY, Engine, EngineError, EngineOptions, RUNNER_IDENTITY, STATUS_IN_PROGRESS,
    TAG_CREATOR, TAG_POOL, TAG_RUNNER, TAG_STATUS,
};
use crate::pool::Pool;
use crate::provider::{Credentials, Instance};
use crate::spec::{FileEntry, OsFamily, ResourceSpec, StepSpec};
use crate::test_support::{FakeProvisioner, FakeTransport, SessionScript};
use crate::transport::{OutputSink, RetryPolicy, Signal};

struct NullSink;

impl OutputSink for NullSink {
    fn write_chunk(&self, _chunk: &[u8]) {}
}

#[derive(Default)]
struct CollectSink {
    chunks: Mutex<Vec<Vec<u8>>>,
}

impl OutputSink for CollectSink {
    fn write_chunk(&self, chunk: &[u8]) {
        self.chunks
            .lock()
            .expect("sink lock should not be poisoned")
            .push(chunk.to_vec());
    }
}

fn base_spec() -> ResourceSpec {
    ResourceSpec::builder()
        .account(Credentials::new("access", "secret", "eu-west-1"))
        .image("img-1234")
        .instance_type("t3.large")
        .user("build")
        .private_key("pem")
        .root("/workspace")
        .build()
        .expect("spec should build")
}

fn fast_options() -> EngineOptions {
    EngineOptions::new("runner-1")
        .with_retry(RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        })
        .with_warmup_delay(Duration::ZERO)
}

fn engine(
    provider: &FakeProvisioner,
    transport: &FakeTransport,
    options: EngineOptions,
) -> Engine<FakeProvisioner, FakeTransport> {
    Engine::new(provider.clone(), transport.clone(), options)
}

#[rstest]
fn options_default_to_production_timings() {
    let options = EngineOptions::new("runner-1");
    assert_eq!(options.warmup_delay, DEFAULT_WARMUP_DELAY);
    assert_eq!(options.retry, RetryPolicy::default());
}

#[rstest]
#[tokio::test]
async fn setup_uses_a_pooled_instance_without_provisioning() {
    let provider = FakeProvisioner::new();
    provider.push_reservation(Some(Instance::new("i-pool", "10.0.0.9")));
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    spec.use_pool = true;
    spec.pool_name = "warm".to_owned();

    engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect("setup should succeed");

    assert_eq!(spec.instance, Some(Instance::new("i-pool", "10.0.0.9")));
    assert!(provider.created().is_empty(), "no machine should be created");
    assert!(transport.dialed().is_empty(), "pooled machines are pre-configured");
}

#[rstest]
#[tokio::test]
async fn setup_provisions_and_configures_an_ad_hoc_instance() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    spec.files = vec![
        FileEntry::directory("/workspace/opt", 0o755),
        FileEntry::file("/workspace/opt/entry.sh", "echo boot\n", 0o700),
    ];
    spec.ephemeral_volumes = vec!["/workspace/cache".into()];

    engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect("setup should succeed");

    let bound = spec.instance.expect("instance should be bound");
    assert_eq!(provider.created().len(), 1);
    assert_eq!(transport.dialed()[0].ip, bound.ip);
    assert_eq!(transport.dialed()[0].user, "build");

    // Workspace root first, then directories, files, and volume directories.
    assert_eq!(
        transport.mkdirs(),
        [
            (Utf8PathBuf::from("/workspace"), 0o777),
            (Utf8PathBuf::from("/workspace/opt"), 0o755),
            (Utf8PathBuf::from("/workspace/cache"), 0o777),
        ]
    );
    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].path, "/workspace/opt/entry.sh");
    assert_eq!(uploads[0].mode, 0o700);

    assert_eq!(transport.commands(), ["docker network create skiff"]);
}

#[rstest]
#[tokio::test]
async fn setup_stamps_bookkeeping_tags() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    spec.pool_name = "warm".to_owned();
    engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect("setup should succeed");

    let tags = &provider.created()[0].tags;
    assert_eq!(tags.get(TAG_RUNNER).map(String::as_str), Some(RUNNER_IDENTITY));
    assert_eq!(tags.get(TAG_POOL).map(String::as_str), Some("warm"));
    assert_eq!(tags.get(TAG_CREATOR).map(String::as_str), Some("runner-1"));
    assert!(!tags.contains_key(TAG_STATUS), "ad-hoc machines carry no claim marker");
}

#[rstest]
#[tokio::test]
async fn pool_backed_fallback_marks_the_instance_in_progress() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    // Empty pool: reservation finds nothing and setup provisions instead.
    let mut spec = base_spec();
    spec.use_pool = true;
    spec.pool_name = "warm".to_owned();
    engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect("setup should succeed");

    let tags = &provider.created()[0].tags;
    assert_eq!(tags.get(TAG_STATUS).map(String::as_str), Some(STATUS_IN_PROGRESS));
}

#[rstest]
#[tokio::test]
async fn reservation_failure_falls_through_to_provisioning() {
    let provider = FakeProvisioner::new();
    provider.push_reservation_error("tag query timed out");
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    spec.use_pool = true;
    spec.pool_name = "warm".to_owned();
    engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect("setup should fall back to provisioning");
    assert_eq!(provider.created().len(), 1);
}

#[rstest]
#[tokio::test]
async fn setup_retries_the_dial_until_the_machine_responds() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    transport.push_dial_error("connection refused");
    transport.push_dial_error("connection refused");
    transport.push_dial_success();
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect("setup should succeed after retries");
    assert_eq!(transport.dialed().len(), 3);
}

#[rstest]
#[tokio::test]
async fn setup_surfaces_connectivity_failure_after_exhausting_retries() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    for _ in 0..3 {
        transport.push_dial_error("connection refused");
    }
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    let err = engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect_err("setup should fail");
    assert!(matches!(err, EngineError::Connectivity { .. }), "got: {err}");
    // The machine stays bound so the caller can destroy it.
    assert!(spec.instance.is_some());
}

#[rstest]
#[tokio::test]
async fn staging_failure_aborts_before_the_network_bootstrap() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    transport.push_mkdir_error("disk full");
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    let err = engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect_err("setup should fail");
    assert!(matches!(err, EngineError::Staging { .. }), "got: {err}");
    assert!(transport.commands().is_empty());
}

#[rstest]
#[tokio::test]
async fn windows_images_use_the_nat_network_driver() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    spec.os = OsFamily::Windows;
    engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect("setup should succeed");
    assert_eq!(transport.commands(), ["docker network create --driver nat skiff"]);
}

#[rstest]
#[tokio::test]
async fn network_bootstrap_failure_is_surfaced_with_the_command() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    transport.push_session(SessionScript::Exit(1));
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    let err = engine
        .setup(&mut spec, &CancellationToken::new())
        .await
        .expect_err("setup should fail");
    let EngineError::NetworkBootstrap { command, .. } = err else {
        panic!("expected a network bootstrap error, got: {err}");
    };
    assert_eq!(command, "docker network create skiff");
}

#[rstest]
#[tokio::test]
async fn destroy_requires_a_bound_instance() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let err = engine
        .destroy(&base_spec())
        .await
        .expect_err("destroy should fail");
    assert!(matches!(err, EngineError::NotBound));
}

#[rstest]
#[tokio::test]
async fn destroy_releases_the_bound_instance() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let mut spec = base_spec();
    spec.instance = Some(Instance::new("i-bound", "10.0.0.5"));
    engine.destroy(&spec).await.expect("destroy should succeed");
    assert_eq!(provider.destroyed(), [Instance::new("i-bound", "10.0.0.5")]);
}

async fn wait_for_creates(provider: &FakeProvisioner, expected: usize) {
    for _ in 0..100 {
        if provider.created().len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {expected} create call(s), saw {}",
        provider.created().len()
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn destroy_replenishes_a_depleted_pool() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    let options = fast_options().with_pool("warm", Pool::new(base_spec(), 1));
    let engine = engine(&provider, &transport, options);

    let mut spec = base_spec();
    spec.use_pool = true;
    spec.pool_name = "warm".to_owned();
    spec.instance = Some(Instance::new("i-used", "10.0.0.5"));

    engine.destroy(&spec).await.expect("destroy should succeed");
    wait_for_creates(&provider, 1).await;
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(provider.created().len(), 1, "exactly one replacement is provisioned");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn destroy_skips_replenishment_when_the_pool_is_full() {
    let provider = FakeProvisioner::new();
    provider.set_free_count("warm", 1);
    let transport = FakeTransport::new();
    let options = fast_options().with_pool("warm", Pool::new(base_spec(), 1));
    let engine = engine(&provider, &transport, options);

    let mut spec = base_spec();
    spec.use_pool = true;
    spec.pool_name = "warm".to_owned();
    spec.instance = Some(Instance::new("i-used", "10.0.0.5"));

    engine.destroy(&spec).await.expect("destroy should succeed");
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert!(provider.created().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn failed_destroy_does_not_replenish() {
    let provider = FakeProvisioner::new();
    provider.push_destroy_error("instance busy");
    let transport = FakeTransport::new();
    let options = fast_options().with_pool("warm", Pool::new(base_spec(), 1));
    let engine = engine(&provider, &transport, options);

    let mut spec = base_spec();
    spec.use_pool = true;
    spec.pool_name = "warm".to_owned();
    spec.instance = Some(Instance::new("i-used", "10.0.0.5"));

    let err = engine.destroy(&spec).await.expect_err("destroy should fail");
    assert!(matches!(err, EngineError::Destroy { .. }), "got: {err}");
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert!(provider.created().is_empty());
}

#[rstest]
#[tokio::test]
async fn ping_surfaces_the_provider_error_unmodified() {
    let provider = FakeProvisioner::new();
    provider.push_ping_error("credentials rejected");
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let err = engine
        .ping(&Credentials::new("access", "secret", "eu-west-1"))
        .await
        .expect_err("ping should fail");
    assert_eq!(err.to_string(), "credentials rejected");
    assert_eq!(provider.ping_calls(), 1);
}

fn bound_spec() -> ResourceSpec {
    let mut spec = base_spec();
    spec.instance = Some(Instance::new("i-bound", "10.0.0.5"));
    spec
}

fn shell_step() -> StepSpec {
    StepSpec {
        command: "sh".to_owned(),
        args: vec!["/workspace/step.sh".to_owned()],
        working_dir: "/workspace".into(),
        ..StepSpec::default()
    }
}

#[rstest]
#[tokio::test]
async fn run_requires_a_bound_instance() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let err = engine
        .run(&base_spec(), &shell_step(), &NullSink, &CancellationToken::new())
        .await
        .expect_err("run should fail");
    assert!(matches!(err, EngineError::NotBound));
}

#[rstest]
#[case::success(SessionScript::Exit(0), 0)]
#[case::structured_failure(SessionScript::Exit(7), 7)]
#[case::transport_failure(SessionScript::Fail("connection reset".to_owned()), 255)]
#[tokio::test]
async fn run_maps_the_session_outcome_to_an_exit_state(
    #[case] script: SessionScript,
    #[case] expected_exit: i32,
) {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    transport.push_session(script);
    let engine = engine(&provider, &transport, fast_options());

    let state = engine
        .run(&bound_spec(), &shell_step(), &NullSink, &CancellationToken::new())
        .await
        .expect("command failures are reported through the state");
    assert_eq!(state.exit_code, expected_exit);
    assert!(state.exited);
    assert!(!state.oom_killed);
    assert_eq!(transport.commands(), ["sh /workspace/step.sh"]);
}

#[rstest]
#[tokio::test]
async fn run_streams_output_into_the_sink() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    transport.push_session(SessionScript::Output {
        chunks: vec![b"hello\n".to_vec(), b"world\n".to_vec()],
        exit: 0,
    });
    let engine = engine(&provider, &transport, fast_options());

    let sink = CollectSink::default();
    engine
        .run(&bound_spec(), &shell_step(), &sink, &CancellationToken::new())
        .await
        .expect("run should succeed");
    let chunks = sink.chunks.lock().expect("sink lock should not be poisoned");
    assert_eq!(*chunks, [b"hello\n".to_vec(), b"world\n".to_vec()]);
}

#[rstest]
#[tokio::test]
async fn run_stages_step_files_with_a_generated_preamble() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    let engine = engine(&provider, &transport, fast_options());

    let mut step = shell_step();
    step.envs.insert("CI".to_owned(), "true".to_owned());
    step.files = vec![FileEntry::file("/workspace/step.sh", "echo hi\n", 0o700)];

    engine
        .run(&bound_spec(), &step, &NullSink, &CancellationToken::new())
        .await
        .expect("run should succeed");

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].path, "/workspace/step.sh");
    assert_eq!(uploads[0].mode, 0o700);
    let staged = String::from_utf8(uploads[0].data.clone()).expect("staged script is UTF-8");
    assert_eq!(staged, "cd /workspace\nexport CI=true\necho hi\n");
}

#[rstest]
#[tokio::test]
async fn run_surfaces_step_file_staging_failures() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    transport.push_upload_error("permission denied");
    let engine = engine(&provider, &transport, fast_options());

    let mut step = shell_step();
    step.files = vec![FileEntry::file("/workspace/step.sh", "echo hi\n", 0o700)];
    let err = engine
        .run(&bound_spec(), &step, &NullSink, &CancellationToken::new())
        .await
        .expect_err("run should fail");
    assert!(matches!(err, EngineError::Staging { .. }), "got: {err}");
    assert!(transport.commands().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_kills_the_remote_process() {
    let provider = FakeProvisioner::new();
    let transport = FakeTransport::new();
    transport.push_session(SessionScript::Pending);
    let engine = engine(&provider, &transport, fast_options());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let err = engine
        .run(&bound_spec(), &shell_step(), &NullSink, &cancel)
        .await
        .expect_err("run should be cancelled");
    assert!(matches!(err, EngineError::Cancelled), "got: {err}");
    assert_eq!(transport.signals(), [Signal::Kill]);
}
