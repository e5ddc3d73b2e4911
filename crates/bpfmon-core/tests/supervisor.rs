//! Supervisor tests against real child processes.
//!
//! `/bin/sh` stands in for the tracer: each probe file is a shell script, so
//! the supervisor runs `sh <probe file>` in its own process group.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bpfmon_core::{
    interrupt_channel, EventRecord, ExitDisposition, InterruptListener, LaunchOptions,
    MonitorConfig, MonitorError, ProbeDescriptor, ProbeSupervisor, SessionStatus, SessionStore,
};
use tempfile::TempDir;

const ENDLESS: &str = r#"
while true; do
  echo '{"ts":1,"type":"process","event":"tick","comm":"sh"}'
  sleep 0.05
done
"#;

struct Fixture {
    dir: TempDir,
    config: Arc<MonitorConfig>,
    store: SessionStore,
}

impl Fixture {
    fn new() -> Self {
        Self::with(|_| {})
    }

    fn with(tweak: impl FnOnce(&mut MonitorConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MonitorConfig {
            sessions_dir: dir.path().join("sessions"),
            reports_dir: dir.path().join("reports"),
            probes_dir: dir.path().join("probes"),
            tracer: "sh".into(),
            grace_period_ms: 1_000,
            drain_timeout_ms: 1_000,
            progress_interval_ms: 50,
            ..MonitorConfig::default()
        };
        tweak(&mut config);
        let store = SessionStore::new(&config.sessions_dir);
        Self {
            dir,
            config: Arc::new(config),
            store,
        }
    }

    fn probe(&self, name: &str, script: &str) -> ProbeDescriptor {
        let probes = self.dir.path().join("probes");
        std::fs::create_dir_all(&probes).unwrap();
        let path = probes.join(format!("{name}.bt"));
        std::fs::write(&path, script).unwrap();
        ProbeDescriptor::from_path(path)
    }

    fn supervisor(&self) -> ProbeSupervisor {
        ProbeSupervisor::new(Arc::clone(&self.config), self.store.clone())
    }
}

fn assert_all_records_complete(events_path: &Path) {
    let content = std::fs::read_to_string(events_path).unwrap();
    assert!(content.is_empty() || content.ends_with('\n'));
    for line in content.lines() {
        assert!(EventRecord::parse(line).is_some(), "not a record: {line:?}");
    }
}

#[tokio::test]
async fn normal_exit_completes_and_partitions_output() {
    let fx = Fixture::new();
    let probe = fx.probe(
        "exec",
        r#"
echo '{"ts":1,"event":"exec"}'
echo 'not-json'
echo 'Attaching 1 probe...' >&2
"#,
    );

    let outcome = fx
        .supervisor()
        .launch(&probe, LaunchOptions::new(None, InterruptListener::never()))
        .await
        .unwrap();

    assert_eq!(outcome.disposition, ExitDisposition::Normal);
    assert_eq!(outcome.status(), SessionStatus::Completed);
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stats.events, 1);
    assert_eq!(outcome.stats.diagnostics, 2);

    let events = std::fs::read_to_string(outcome.session.events_path()).unwrap();
    assert_eq!(events, "{\"ts\":1,\"event\":\"exec\"}\n");
    let diags = std::fs::read_to_string(outcome.session.diagnostics_path()).unwrap();
    assert!(diags.contains("not-json\n"));
    assert!(diags.contains("Attaching 1 probe...\n"));

    let meta = outcome.session.read_meta().unwrap();
    assert_eq!(meta.status, SessionStatus::Completed);
    assert_eq!(meta.event_count, 1);
    assert!(meta.ended_at.is_some());
}

#[tokio::test]
async fn bound_stops_endless_probe() {
    let fx = Fixture::new();
    let probe = fx.probe("endless", ENDLESS);

    let started = Instant::now();
    let outcome = fx
        .supervisor()
        .launch(
            &probe,
            LaunchOptions::new(Some(Duration::from_millis(400)), InterruptListener::never()),
        )
        .await
        .unwrap();

    assert_eq!(outcome.disposition, ExitDisposition::TimedOut);
    assert_eq!(outcome.status(), SessionStatus::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(outcome.duration >= Duration::from_millis(400));
    assert!(outcome.stats.events > 0);
    assert_all_records_complete(&outcome.session.events_path());

    let listed = fx.store.list_sessions().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, SessionStatus::TimedOut);
}

#[tokio::test]
async fn interrupt_keeps_only_complete_records() {
    let fx = Fixture::new();
    let probe = fx.probe("endless", ENDLESS);
    let (interrupter, listener) = interrupt_channel();

    let fire = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        interrupter.fire();
    });
    let outcome = fx
        .supervisor()
        .launch(&probe, LaunchOptions::new(None, listener))
        .await
        .unwrap();
    fire.await.unwrap();

    assert_eq!(outcome.disposition, ExitDisposition::Interrupted);
    assert_eq!(
        outcome.session.read_meta().unwrap().status,
        SessionStatus::Interrupted
    );
    assert!(outcome.has_usable_data());
    assert_all_records_complete(&outcome.session.events_path());
}

#[tokio::test]
async fn nonzero_exit_is_failed_with_partial_data() {
    let fx = Fixture::new();
    let probe = fx.probe(
        "crash",
        r#"
echo '{"ts":1,"event":"exec"}'
echo 'ERROR: could not attach' >&2
exit 3
"#,
    );

    let outcome = fx
        .supervisor()
        .launch(&probe, LaunchOptions::new(None, InterruptListener::never()))
        .await
        .unwrap();

    assert_eq!(outcome.disposition, ExitDisposition::Failed { code: Some(3) });
    assert_eq!(outcome.meta.exit_code, Some(3));
    assert_eq!(outcome.meta.status, SessionStatus::Failed);
    assert!(outcome.has_usable_data());
}

#[tokio::test]
async fn lost_metadata_still_returns_outcome() {
    let fx = Fixture::new();
    let probe = fx.probe(
        "exec",
        r#"
echo '{"ts":1,"event":"exec"}'
sleep 0.4
"#,
    );

    let sessions = fx.config.sessions_dir.clone();
    let remove = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let dir = std::fs::read_dir(&sessions)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::remove_file(dir.join("session.json")).unwrap();
    });
    let outcome = fx
        .supervisor()
        .launch(&probe, LaunchOptions::new(None, InterruptListener::never()))
        .await
        .expect("finished run is an outcome, not an error");
    remove.await.unwrap();

    assert_eq!(outcome.disposition, ExitDisposition::Failed { code: Some(0) });
    assert_eq!(outcome.meta.status, SessionStatus::Failed);
    assert_eq!(outcome.meta.probe_id, "exec");
    assert_eq!(outcome.meta.event_count, 1);
    assert!(outcome.meta.ended_at.is_some());
    assert_eq!(outcome.stats.events, 1);
    assert!(outcome.has_usable_data());
    assert_all_records_complete(&outcome.session.events_path());
}

#[tokio::test]
async fn sigterm_ignored_escalates_to_sigkill() {
    let fx = Fixture::with(|c| c.grace_period_ms = 200);
    let probe = fx.probe(
        "stubborn",
        r#"
trap '' TERM
echo '{"ts":1,"event":"start"}'
while true; do sleep 0.05; done
"#,
    );

    let started = Instant::now();
    let outcome = fx
        .supervisor()
        .launch(
            &probe,
            LaunchOptions::new(Some(Duration::from_millis(200)), InterruptListener::never()),
        )
        .await
        .unwrap();

    assert_eq!(outcome.disposition, ExitDisposition::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn lingering_grandchild_is_killed_after_drain_timeout() {
    let fx = Fixture::with(|c| c.drain_timeout_ms = 300);
    // The background sleep inherits stdout and keeps the pipe open after sh exits.
    let probe = fx.probe(
        "leaky",
        r#"
sleep 30 &
echo '{"ts":1,"event":"exec"}'
exit 0
"#,
    );

    let started = Instant::now();
    let outcome = fx
        .supervisor()
        .launch(&probe, LaunchOptions::new(None, InterruptListener::never()))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.disposition, ExitDisposition::Normal);
    assert_eq!(outcome.stats.events, 1);
}

#[tokio::test]
async fn missing_tracer_fails_session_and_names_it() {
    let fx = Fixture::with(|c| c.tracer = "/nonexistent/bpftrace".into());
    let probe = fx.probe("exec", "echo hi\n");

    let err = fx
        .supervisor()
        .launch(&probe, LaunchOptions::new(None, InterruptListener::never()))
        .await
        .unwrap_err();

    let MonitorError::ProcessLaunch {
        probe: probe_id,
        session_id,
        ..
    } = &err
    else {
        panic!("expected launch failure, got {err:?}");
    };
    assert_eq!(probe_id, "exec");
    let meta = fx.store.handle(session_id).read_meta().unwrap();
    assert_eq!(meta.status, SessionStatus::Failed);
}

#[tokio::test]
async fn missing_probe_file_creates_no_session() {
    let fx = Fixture::new();
    let probe = ProbeDescriptor::from_path(fx.dir.path().join("probes/absent.bt"));

    let err = fx
        .supervisor()
        .launch(&probe, LaunchOptions::new(None, InterruptListener::never()))
        .await
        .unwrap_err();

    assert!(matches!(err, MonitorError::ProbeFileMissing { .. }));
    assert!(!fx.config.sessions_dir.exists());
}

#[tokio::test]
async fn progress_ticks_while_running() {
    let fx = Fixture::new();
    let probe = fx.probe("endless", ENDLESS);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let outcome = fx
        .supervisor()
        .launch(
            &probe,
            LaunchOptions::new(Some(Duration::from_millis(300)), InterruptListener::never())
                .with_progress(tx),
        )
        .await
        .unwrap();

    let first = rx.recv().await.expect("at least one tick");
    assert_eq!(first.session_id, outcome.session.id);
    assert!(first.remaining.unwrap() <= Duration::from_millis(300));
}

#[tokio::test]
async fn back_to_back_runs_get_distinct_sessions() {
    let fx = Fixture::new();
    let probe = fx.probe("quick", "echo '{\"ts\":1,\"event\":\"exec\"}'\n");

    let a = fx
        .supervisor()
        .launch(&probe, LaunchOptions::new(None, InterruptListener::never()))
        .await
        .unwrap();
    let b = fx
        .supervisor()
        .launch(&probe, LaunchOptions::new(None, InterruptListener::never()))
        .await
        .unwrap();

    assert_ne!(a.session.id, b.session.id);
    assert_ne!(a.session.dir, b.session.dir);
    assert_eq!(fx.store.list_sessions().unwrap().len(), 2);
}
