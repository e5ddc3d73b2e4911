//! Report aggregation over session directories.

use std::io::Write;

use bpfmon_core::report::{write_report, Aggregator};
use bpfmon_core::{
    summarize, ProbeDescriptor, ReportFormat, ReportPolicy, SessionHandle, SessionStore, Summary,
};

fn session_with_events(lines: &[&str]) -> (tempfile::TempDir, SessionHandle) {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("sessions"));
    let handle = store
        .create_session(&ProbeDescriptor::from_path("probes/exec.bt"), None)
        .unwrap();
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(handle.events_path())
        .unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    (dir, handle)
}

#[test]
fn exec_and_fork_total_three() {
    let (_dir, handle) = session_with_events(&[
        r#"{"ts":1,"event":"exec"}"#,
        r#"{"ts":2,"event":"fork"}"#,
        r#"{"ts":3,"event":"fork"}"#,
    ]);

    let summary = summarize(&handle, ReportFormat::Json).unwrap();
    let report = summary.report().unwrap();
    assert_eq!(report.total_events, 3);
    assert_eq!(report.events_by_name.get("exec"), Some(&1));
    assert_eq!(report.events_by_name.get("fork"), Some(&2));
    assert_eq!(report.probe_id.as_deref(), Some("exec"));
}

#[test]
fn counts_sum_to_total_over_k_groups_in_any_order() {
    let names = ["exec", "fork", "exit", "openat", "connect"];
    let mut lines: Vec<String> = (0..50)
        .map(|i| format!("{{\"ts\":{i},\"event\":\"{}\"}}\n", names[i % names.len()]))
        .collect();

    let forward = {
        let mut agg = Aggregator::new();
        agg.consume(lines.concat().as_bytes()).unwrap();
        agg.finish("s", None, ReportFormat::Json)
    };
    lines.reverse();
    let reversed = {
        let mut agg = Aggregator::new();
        agg.consume(lines.concat().as_bytes()).unwrap();
        agg.finish("s", None, ReportFormat::Json)
    };

    for report in [&forward, &reversed] {
        assert_eq!(report.total_events, 50);
        assert_eq!(report.events_by_name.len(), names.len());
        assert_eq!(report.events_by_name.values().sum::<u64>(), 50);
    }
    assert_eq!(forward.events_by_name, reversed.events_by_name);
}

#[test]
fn empty_log_reports_zero_and_missing_log_is_empty_summary() {
    let (_dir, handle) = session_with_events(&[]);
    let summary = summarize(&handle, ReportFormat::Text).unwrap();
    assert_eq!(summary.report().unwrap().total_events, 0);

    std::fs::remove_file(handle.events_path()).unwrap();
    let summary = summarize(&handle, ReportFormat::Text).unwrap();
    assert!(matches!(summary, Summary::Empty { .. }));
}

#[test]
fn report_artifact_lands_in_reports_dir() {
    let (dir, handle) = session_with_events(&[r#"{"ts":1,"type":"syscall","event":"openat","data":{"ret":-13,"lat_us":4}}"#]);
    let reports = dir.path().join("reports");

    let report = summarize(&handle, ReportFormat::Markdown)
        .unwrap()
        .into_report()
        .unwrap();
    let path = write_report(&reports, &report, ReportPolicy::Refuse).unwrap();

    assert_eq!(path, reports.join(format!("{}.md", handle.id)));
    let md = std::fs::read_to_string(&path).unwrap();
    assert!(md.contains("## Return Values"));
    // The session directory itself is untouched.
    let entries: Vec<_> = std::fs::read_dir(&handle.dir).unwrap().collect();
    assert_eq!(entries.len(), 3);
}
