use std::fmt::Write;

use super::{Report, ReportFormat};
use crate::error::Result;

/// Render `report` in `format`.
pub fn render(report: &Report, format: ReportFormat) -> Result<String> {
    Ok(match format {
        ReportFormat::Json => render_json(report)?,
        ReportFormat::Text => render_text(report),
        ReportFormat::Markdown => render_markdown(report),
    })
}

pub fn render_json(report: &Report) -> Result<String> {
    let mut out = serde_json::to_string_pretty(report)?;
    out.push('\n');
    Ok(out)
}

/// Plain-text summary for terminals.
pub fn render_text(report: &Report) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "========== SESSION SUMMARY ==========");
    let _ = writeln!(out, "Session: {}", report.session_id);
    if let Some(probe) = &report.probe_id {
        let _ = writeln!(out, "Probe:   {probe}");
    }
    let _ = writeln!(out, "\nTotal events: {}", report.total_events);

    if !report.events_by_type.is_empty() {
        let _ = writeln!(out, "\nEvents by type:");
        for (name, count) in &report.events_by_type {
            let _ = writeln!(out, "  {name}: {count}");
        }
    }

    if !report.events_by_name.is_empty() {
        let _ = writeln!(out, "\nEvents by name:");
        for (name, count) in &report.events_by_name {
            let _ = writeln!(out, "  {name}: {count}");
        }
    }

    if !report.top_processes.is_empty() {
        let _ = writeln!(out, "\nTop processes:");
        for entry in &report.top_processes {
            let _ = writeln!(out, "  {}: {}", entry.name, entry.count);
        }
    }

    if !report.returns.is_empty() {
        let _ = writeln!(out, "\nReturn values:");
        for (event, stats) in &report.returns {
            let _ = writeln!(
                out,
                "  {event}: {} (nonzero: {}, errors: {}, {:.1}%)",
                stats.calls,
                stats.nonzero,
                stats.errors,
                stats.error_rate() * 100.0
            );
        }
    }

    if let Some(lat) = &report.latency {
        let _ = writeln!(out, "\nLatency (microseconds, {} samples):", lat.samples);
        let _ = writeln!(out, "  min_us: {}", lat.min_us);
        let _ = writeln!(out, "  p50_us: {:.1}", lat.p50_us);
        let _ = writeln!(out, "  p95_us: {:.1}", lat.p95_us);
        let _ = writeln!(out, "  max_us: {}", lat.max_us);
        let _ = writeln!(out, "  mean_us: {:.1}", lat.mean_us);
    }

    let _ = writeln!(
        out,
        "\nLines: {} read, {} skipped{}",
        report.lines.lines,
        report.lines.skipped,
        if report.lines.incomplete_tail {
            ", incomplete tail ignored"
        } else {
            ""
        }
    );
    let _ = writeln!(out, "sha256: {}", report.sha256);
    let _ = writeln!(out, "=====================================");
    out
}

/// Markdown summary, one table per section.
pub fn render_markdown(report: &Report) -> String {
    let mut md = format!("# Session Summary: {}\n\n", report.session_id);
    if let Some(probe) = &report.probe_id {
        md.push_str(&format!("- probe: `{probe}`\n"));
    }
    md.push_str(&format!("- total events: {}\n", report.total_events));
    md.push_str(&format!(
        "- generated: {}\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    push_count_table(&mut md, "Events by Type", "type", report.events_by_type.iter());
    push_count_table(&mut md, "Events by Name", "event", report.events_by_name.iter());
    push_count_table(
        &mut md,
        "Top Processes",
        "comm",
        report.top_processes.iter().map(|e| (&e.name, &e.count)),
    );

    if !report.returns.is_empty() {
        md.push_str("\n## Return Values\n\n| event | calls | nonzero | errors | error rate |\n|---|---:|---:|---:|---:|\n");
        for (event, stats) in &report.returns {
            md.push_str(&format!(
                "| `{}` | {} | {} | {} | {:.1}% |\n",
                event,
                stats.calls,
                stats.nonzero,
                stats.errors,
                stats.error_rate() * 100.0
            ));
        }
    }

    if let Some(lat) = &report.latency {
        md.push_str("\n## Latency (us)\n\n| samples | min | p50 | p95 | max | mean |\n|---:|---:|---:|---:|---:|---:|\n");
        md.push_str(&format!(
            "| {} | {} | {:.1} | {:.1} | {} | {:.1} |\n",
            lat.samples, lat.min_us, lat.p50_us, lat.p95_us, lat.max_us, lat.mean_us
        ));
    }

    md.push_str("\n## Input\n\n");
    md.push_str(&format!(
        "- lines read: {}\n- lines skipped: {}\n- incomplete tail: {}\n- sha256: `{}`\n",
        report.lines.lines,
        report.lines.skipped,
        if report.lines.incomplete_tail { "yes" } else { "no" },
        report.sha256
    ));
    md
}

fn push_count_table<'a>(
    md: &mut String,
    title: &str,
    key: &str,
    rows: impl Iterator<Item = (&'a String, &'a u64)>,
) {
    let mut rows = rows.peekable();
    if rows.peek().is_none() {
        return;
    }
    md.push_str(&format!("\n## {title}\n\n| {key} | count |\n|---|---:|\n"));
    for (name, count) in rows {
        md.push_str(&format!("| `{name}` | {count} |\n"));
    }
}
