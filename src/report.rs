use std::fmt::Write;

use chrono::{Local, TimeZone};

use crate::models::domain::{BurstRecord, TrialResult};
use crate::models::dto::ProbeReportDTO;
use crate::probe::{ProbeReport, Termination};

/// Bursts shown under each trial in the text report.
const RECENT_BURSTS: usize = 5;

pub fn clock_time(timestamp: f64) -> String {
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9) as u32;
    match Local.timestamp_opt(secs as i64, nanos).single() {
        Some(time) => time.format("%H:%M:%S").to_string(),
        None => format!("{:.3}", timestamp),
    }
}

pub fn render_bursts(records: &[BurstRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<8} {:<10} {:<10} {:<10} {:<10} {:<10}",
        "Worker", "Start", "End", "Packets", "MiB", "Mbps"
    );
    for record in records {
        let _ = writeln!(
            out,
            "{:<8} {:<10} {:<10} {:<10} {:<10.2} {:<10.2}",
            format!("T{}", record.worker_id),
            clock_time(record.start_time),
            clock_time(record.end_time),
            record.packet_count,
            record.byte_total as f64 / (1024.0 * 1024.0),
            record.throughput_mbps
        );
    }
    out
}

/// `contended/attempts`, or `-` when the trial had no shared lock.
fn contention_cell(trial: &TrialResult) -> String {
    if trial.recv_attempts == 0 {
        return "-".to_string();
    }
    format!("{}/{}", trial.contended_attempts, trial.recv_attempts)
}

pub fn render_report(report: &ProbeReport) -> String {
    let mut out = String::new();

    for step in &report.history {
        let trial = &step.trial;
        let _ = writeln!(out, "{}", "=".repeat(60));
        let _ = writeln!(
            out,
            "{} workers: {} packets, {} bursts, {:.2} Mbps ({})",
            trial.worker_count,
            trial.total_packets,
            trial.burst_records.len(),
            trial.aggregate_throughput_mbps,
            step.verdict
        );
        if trial.burst_records.is_empty() {
            let _ = writeln!(out, "No data received during the trial; check that the sender is running.");
        } else {
            let skip = trial.burst_records.len().saturating_sub(RECENT_BURSTS);
            out.push_str(&render_bursts(&trial.burst_records[skip..]));
        }
    }

    let _ = writeln!(out, "\n{}", "=".repeat(60));
    let _ = writeln!(out, "TEST RESULTS SUMMARY:");
    let _ = writeln!(
        out,
        "{:<8} {:<12} {:<12} {:<10} {:<8} {:<16} {}",
        "Workers", "Burst Mbps", "Window Mbps", "Packets", "Bursts", "Contended", "Verdict"
    );
    let _ = writeln!(out, "{}", "-".repeat(88));
    for step in &report.history {
        let trial = &step.trial;
        let marker = if trial.worker_count == report.optimal_worker_count {
            " <- OPTIMAL"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "{:<8} {:<12.2} {:<12.2} {:<10} {:<8} {:<16} {}{}",
            trial.worker_count,
            trial.aggregate_throughput_mbps,
            trial.window_throughput_mbps,
            trial.total_packets,
            trial.burst_records.len(),
            contention_cell(trial),
            step.verdict,
            marker
        );
    }

    let _ = writeln!(out);
    match report.termination {
        Termination::DegradationDetected { failed_at } => {
            let _ = writeln!(out, "DEGRADATION DETECTED at {} workers", failed_at);
        }
        Termination::CeilingReached => {
            let _ = writeln!(out, "Reached the worker ceiling without degradation");
        }
        Termination::Interrupted => {
            let _ = writeln!(out, "Optimization interrupted by user");
        }
    }
    if let Some(baseline) = report.baseline_throughput_mbps {
        let _ = writeln!(out, "Best throughput: {:.2} Mbps", baseline);
    }
    let _ = writeln!(out, "Optimal number of workers: {}", report.optimal_worker_count);
    out
}

pub fn render_json(report: &ProbeReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&ProbeReportDTO::from(report))
}
