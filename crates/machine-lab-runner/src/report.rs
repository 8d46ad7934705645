//! Aggregation of completed runs into the suite verdict and result files.

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::executor::RunStatus;
use crate::fsutil::{atomic_write_bytes, atomic_write_json_pretty, tail_lines_with};
use crate::launcher::LOG_FILE;
use crate::scheduler::CompletedRun;

pub const RESULTS_CSV: &str = "results.csv";
pub const RESULTS_JSON: &str = "results.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    None,
    Generic,
    RateLimit,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::None => "",
            ErrorClass::Generic => "error",
            ErrorClass::RateLimit => "rate_limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    pub name: String,
    pub machine_name: Option<String>,
    pub status: RunStatus,
    pub error_class: ErrorClass,
    pub counted_as_success: bool,
    pub log_tail: String,
    pub log_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub requested: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub timeout_count: usize,
    pub rate_limited_count: usize,
    pub records: Vec<ResultRecord>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.error_count == 0 && self.success_count == self.requested
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

fn rate_limit_signature() -> &'static Regex {
    static SIGNATURE: OnceLock<Regex> = OnceLock::new();
    SIGNATURE.get_or_init(|| Regex::new(r#""code"\s*:\s*52\b"#).expect("valid rate limit pattern"))
}

/// The backend's request-frequency error, as it appears in structured log text.
pub fn is_rate_limited(text: &str) -> bool {
    rate_limit_signature().is_match(text)
}

/// `rate_limited` is whether the signature appears anywhere in the run's
/// log, not only in the tail.
pub fn classify(status: RunStatus, rate_limited: bool) -> ErrorClass {
    match status {
        RunStatus::Ok => ErrorClass::None,
        RunStatus::Error if rate_limited => ErrorClass::RateLimit,
        _ => ErrorClass::Generic,
    }
}

struct LogScan {
    tail: String,
    rate_limited: bool,
}

fn scan_log(run_dir: &Path, tail_lines: usize) -> Result<LogScan> {
    let mut rate_limited = false;
    let tail = tail_lines_with(&run_dir.join(LOG_FILE), tail_lines, |line| {
        if !rate_limited && is_rate_limited(line) {
            rate_limited = true;
        }
    })?;
    Ok(LogScan { tail, rate_limited })
}

pub fn aggregate(
    completed: &[CompletedRun],
    requested: usize,
    frequency_limited_account: bool,
    log_tail_lines: usize,
) -> SuiteReport {
    if completed.len() != requested {
        warn!(requested, completed = completed.len(), "completed run count differs from requested");
    }
    let mut report = SuiteReport {
        requested,
        success_count: 0,
        error_count: 0,
        timeout_count: 0,
        rate_limited_count: 0,
        records: Vec::with_capacity(completed.len()),
    };
    for run in completed {
        let (log_tail, rate_limited, log_error) = match scan_log(&run.run_dir, log_tail_lines) {
            Ok(scan) => (scan.tail, scan.rate_limited, None),
            Err(e) => (String::new(), false, Some(format!("failed to get last logs: {}", e))),
        };
        let error_class = classify(run.status, rate_limited);
        let counted_as_success = match error_class {
            ErrorClass::None => true,
            ErrorClass::RateLimit => frequency_limited_account,
            ErrorClass::Generic => false,
        };
        if counted_as_success {
            report.success_count += 1;
        } else {
            report.error_count += 1;
        }
        if run.status == RunStatus::Timeout {
            report.timeout_count += 1;
        }
        if error_class == ErrorClass::RateLimit {
            report.rate_limited_count += 1;
        }
        report.records.push(ResultRecord {
            name: run.run_name.clone(),
            machine_name: run.machine_name.clone(),
            status: run.status,
            error_class,
            counted_as_success,
            log_tail,
            log_error,
        });
    }
    report
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn render_csv(report: &SuiteReport) -> String {
    let mut out = String::from("test_name,status,error,last_logs\n");
    for record in &report.records {
        let error = match &record.log_error {
            Some(log_error) if record.error_class == ErrorClass::None => log_error.clone(),
            Some(log_error) => format!("{}; {}", record.error_class.as_str(), log_error),
            None => record.error_class.as_str().to_string(),
        };
        let row = [
            csv_field(&record.name),
            csv_field(record.status.as_str()),
            csv_field(&error),
            csv_field(&record.log_tail),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

pub fn write_reports(results_dir: &Path, report: &SuiteReport) -> Result<()> {
    atomic_write_bytes(&results_dir.join(RESULTS_CSV), render_csv(report).as_bytes())?;
    atomic_write_json_pretty(&results_dir.join(RESULTS_JSON), report)?;
    info!(path = %results_dir.join(RESULTS_CSV).display(), "wrote suite results");
    Ok(())
}

/// Console summary: successful runs, then failed runs with their log tails.
pub fn render_summary(report: &SuiteReport) -> String {
    let (ok, failed): (Vec<&ResultRecord>, Vec<&ResultRecord>) =
        report.records.iter().partition(|r| r.counted_as_success);
    let mut out = String::new();
    out.push_str(&format!("** {} successful tests **\n", ok.len()));
    for r in &ok {
        let note = if r.error_class == ErrorClass::RateLimit {
            " (rate limited, frequency-limited account)"
        } else {
            ""
        };
        out.push_str(&format!("  -- {}: {}{}\n", r.name, r.status.as_str(), note));
    }
    out.push_str(&format!("** {} failed tests **\n", failed.len()));
    for r in &failed {
        out.push_str(&format!("  -- {}: {}\n", r.name, r.status.as_str()));
        out.push_str(" ----- last log lines ----- \n");
        match &r.log_error {
            Some(e) => out.push_str(&format!("{}\n", e)),
            None => {
                out.push_str(&r.log_tail);
                out.push('\n');
            }
        }
        out.push_str(&format!(" ----- end of last log lines ({}: {}) ----- \n", r.name, r.status.as_str()));
    }
    if report.passed() {
        out.push_str("Great Success!\n");
    } else {
        out.push_str("Test suite failed\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::scratch_dir;
    use std::fs;

    fn completed(root: &Path, name: &str, status: RunStatus, log: Option<&str>) -> CompletedRun {
        let run_dir = root.join(name);
        fs::create_dir_all(&run_dir).unwrap();
        if let Some(log) = log {
            fs::write(run_dir.join(LOG_FILE), log).unwrap();
        }
        CompletedRun {
            run_name: name.to_string(),
            run_dir,
            machine_name: None,
            status,
        }
    }

    const RATE_LIMIT_LOG: &str =
        "creating server\nKamatera API responded with an error: {\"code\":52,\"message\":\"too many requests\"}\n";

    #[test]
    fn rate_limit_signature_matches_code_52_only() {
        assert!(is_rate_limited(r#"{"code":52,"message":"..."}"#));
        assert!(is_rate_limited(r#"{"code": 52, "message":"..."}"#));
        assert!(!is_rate_limited(r#"{"code":520,"message":"..."}"#));
        assert!(!is_rate_limited(r#"{"code":5,"message":"..."}"#));
    }

    #[test]
    fn rate_limited_error_counts_as_success_only_with_flag() {
        let root = scratch_dir("ratelimit");
        let runs = vec![completed(&root, "test1", RunStatus::Error, Some(RATE_LIMIT_LOG))];

        let flagged = aggregate(&runs, 1, true, 10);
        assert_eq!(flagged.records[0].error_class, ErrorClass::RateLimit);
        assert_eq!((flagged.success_count, flagged.error_count), (1, 0));
        assert_eq!(flagged.exit_code(), 0);

        let unflagged = aggregate(&runs, 1, false, 10);
        assert_eq!((unflagged.success_count, unflagged.error_count), (0, 1));
        assert_eq!(unflagged.exit_code(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rate_limit_above_the_tail_is_still_detected() {
        let root = scratch_dir("ratelimit_above_tail");
        let mut log = String::from(RATE_LIMIT_LOG);
        for i in 0..20 {
            log.push_str(&format!("docker-machine rm -y m1 output line {}\n", i));
        }
        let runs = vec![completed(&root, "test1", RunStatus::Error, Some(&log))];
        let report = aggregate(&runs, 1, true, 10);
        assert!(!report.records[0].log_tail.contains("\"code\":52"));
        assert_eq!(report.records[0].error_class, ErrorClass::RateLimit);
        assert_eq!(report.exit_code(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn timeout_is_never_rate_limited() {
        assert_eq!(classify(RunStatus::Timeout, true), ErrorClass::Generic);
        assert_eq!(classify(RunStatus::Ok, true), ErrorClass::None);
    }

    #[test]
    fn timeouts_are_errors_and_every_run_gets_a_record() {
        let root = scratch_dir("aggregate");
        let runs = vec![
            completed(&root, "test1", RunStatus::Ok, Some("Great Success!\n")),
            completed(&root, "test2", RunStatus::Timeout, None),
            completed(&root, "test3", RunStatus::Error, Some("(4) failed\n")),
        ];
        let report = aggregate(&runs, 3, true, 10);
        assert_eq!(report.records.len(), 3);
        assert_eq!(report.success_count, 1);
        assert_eq!(report.error_count, 2);
        assert_eq!(report.timeout_count, 1);
        assert!(report.records[1].log_error.is_some());
        assert_eq!(report.exit_code(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn short_report_fails_even_without_errors() {
        let report = SuiteReport {
            requested: 3,
            success_count: 2,
            error_count: 0,
            timeout_count: 0,
            rate_limited_count: 0,
            records: Vec::new(),
        };
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn csv_quotes_multiline_logs() {
        let report = SuiteReport {
            requested: 1,
            success_count: 0,
            error_count: 1,
            timeout_count: 0,
            rate_limited_count: 0,
            records: vec![ResultRecord {
                name: "test1".into(),
                machine_name: None,
                status: RunStatus::Error,
                error_class: ErrorClass::Generic,
                counted_as_success: false,
                log_tail: "line \"a\"\nline b".into(),
                log_error: None,
            }],
        };
        assert_eq!(
            render_csv(&report),
            "test_name,status,error,last_logs\ntest1,ERROR,error,\"line \"\"a\"\"\nline b\"\n"
        );
    }

    #[test]
    fn reports_are_written_to_results_dir() {
        let root = scratch_dir("write_reports");
        let runs = vec![completed(&root, "test1", RunStatus::Ok, Some("done\n"))];
        let report = aggregate(&runs, 1, false, 10);
        write_reports(&root, &report).expect("write");
        let csv = fs::read_to_string(root.join(RESULTS_CSV)).expect("csv");
        assert!(csv.starts_with("test_name,status,error,last_logs\ntest1,OK,,done"));
        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(root.join(RESULTS_JSON)).expect("json")).expect("parse");
        assert_eq!(json["success_count"], 1);
        assert_eq!(json["records"][0]["status"], "OK");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn summary_lists_failed_runs_with_logs() {
        let root = scratch_dir("summary");
        let runs = vec![
            completed(&root, "test1", RunStatus::Ok, Some("fine\n")),
            completed(&root, "test2", RunStatus::Error, Some("boom\n")),
        ];
        let summary = render_summary(&aggregate(&runs, 2, false, 10));
        assert!(summary.contains("** 1 successful tests **"));
        assert!(summary.contains("  -- test2: ERROR\n ----- last log lines ----- \nboom\n"));
        assert!(summary.ends_with("Test suite failed\n"));
        let _ = fs::remove_dir_all(root);
    }
}
