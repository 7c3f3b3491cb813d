//! Parsing of container logs and utilisation metrics
//!
//! The inference shim writes every line the container prints as a JSON object
//! on its own log line:
//!
//! ```json
//! {"log": "Loading model", "source": "stdout", "internal": false, "level": "INFO"}
//! ```
//!
//! Lines written by the shim itself are marked `internal` and are not shown to
//! users. Lines that cannot be parsed are dropped with a warning, never failing
//! the job: logs are diagnostics only.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use log::{error, warn};
use serde::Deserialize;

use super::clients::{LogEvent, MetricDataResponse};
use super::common::MetricSeries;

/// Number of log lines fetched for a job
pub const LOGLINES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StructuredLog {
    log: String,
    source: LogSource,
    #[serde(default)]
    internal: bool,
    #[serde(default)]
    level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLog {
    pub message: String,
    pub source: LogSource,
    pub level: Option<String>,
}

/// Parse one structured log line. Returns `None` for internal shim lines.
pub fn parse_structured_log(line: &str) -> Result<Option<ParsedLog>, serde_json::Error> {
    let structured: StructuredLog = serde_json::from_str(line)?;
    if structured.internal {
        return Ok(None);
    }
    Ok(Some(ParsedLog {
        message: structured.log,
        source: structured.source,
        level: structured.level,
    }))
}

/// Remove NUL bytes and leading control characters that the log driver can
/// prepend to a message
pub fn strip_control_characters(message: &str) -> String {
    message
        .replace('\0', "")
        .trim_start_matches(|c: char| c.is_control())
        .to_string()
}

pub fn ms_timestamp_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Read an epoch milliseconds timestamp from an event field
pub fn json_ms_timestamp(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    let value = value?;
    let ms = value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))?;
    ms_timestamp_to_datetime(ms)
}

/// Container output split by stream, each line formatted as
/// `<ISO timestamp> <message>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskLogs {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl TaskLogs {
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

pub fn split_task_logs(events: &[LogEvent]) -> TaskLogs {
    let mut logs = TaskLogs::default();

    for event in events {
        let parsed = match parse_structured_log(&strip_control_characters(&event.message)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Could not parse log: {}", e);
                continue;
            }
        };
        let Some(timestamp) = ms_timestamp_to_datetime(event.timestamp) else {
            warn!("Could not parse log timestamp {}", event.timestamp);
            continue;
        };
        let Some(parsed) = parsed else {
            continue;
        };

        let line = format!(
            "{} {}",
            timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, false),
            parsed.message
        );
        match parsed.source {
            LogSource::Stdout => logs.stdout.push(line),
            LogSource::Stderr => logs.stderr.push(line),
            LogSource::Other => error!("Invalid source"),
        }
    }

    logs
}

/// The message to show a user for a failed container: the last line it wrote
/// to stderr, without the timestamp
pub fn user_error(stderr: &str) -> Option<String> {
    let line = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty())?;

    let message = match line.split_once(' ') {
        Some((first, rest)) if DateTime::parse_from_rfc3339(first).is_ok() => rest.trim(),
        _ => line,
    };

    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

/// Search expression for the per-host utilisation metrics of a transform job
pub fn metrics_query(log_group: &str, job_name: &str, period_secs: u32) -> String {
    format!(
        "SEARCH('{{{},Host}} Host={}/i-', 'Average', {})",
        log_group, job_name, period_secs
    )
}

/// Extract the series belonging to `query_id`. A paginated response is kept
/// as is; the missing pages are only reported.
pub fn extract_metric_series(response: &MetricDataResponse, query_id: &str) -> Vec<MetricSeries> {
    if response.next_token.is_some() {
        error!("Too many metrics found");
    }

    response
        .results
        .iter()
        .filter(|r| r.id == query_id)
        .map(|r| MetricSeries {
            label: r.label.clone(),
            status: r.status_code.clone(),
            timestamps: r.timestamps.clone(),
            values: r.values.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::clients::MetricDataResult;

    fn event(timestamp: i64, message: &str) -> LogEvent {
        LogEvent {
            timestamp,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_split_task_logs() {
        let events = vec![
            event(1654516800000, r#"{"log": "hello", "source": "stdout"}"#),
            event(1654516801500, r#"{"log": "oops", "source": "stderr", "level": "WARNING"}"#),
            event(1654516802000, r#"{"log": "shim", "source": "stdout", "internal": true}"#),
            event(1654516803000, "\0\0{\"log\": \"after nul\", \"source\": \"stdout\"}"),
            event(1654516804000, "not json"),
            event(1654516805000, r#"{"source": "stdout"}"#),
            event(1654516806000, r#"{"log": "odd", "source": "syslog"}"#),
        ];

        let logs = split_task_logs(&events);

        assert_eq!(
            logs.stdout,
            vec![
                "2022-06-06T12:00:00+00:00 hello".to_string(),
                "2022-06-06T12:00:03+00:00 after nul".to_string(),
            ]
        );
        assert_eq!(logs.stderr, vec!["2022-06-06T12:00:01.500+00:00 oops".to_string()]);
    }

    #[test]
    fn test_strip_control_characters() {
        assert_eq!(strip_control_characters("\u{1}\u{2}{}"), "{}");
        assert_eq!(strip_control_characters("a\0b"), "ab");
    }

    #[test]
    fn test_json_ms_timestamp() {
        let value = serde_json::json!(1654516800000i64);
        assert_eq!(
            json_ms_timestamp(Some(&value)).unwrap().to_rfc3339(),
            "2022-06-06T12:00:00+00:00"
        );
        assert!(json_ms_timestamp(Some(&serde_json::json!("yesterday"))).is_none());
        assert!(json_ms_timestamp(None).is_none());
    }

    #[test]
    fn test_user_error_uses_last_stderr_line() {
        let stderr = "2022-06-06T12:00:00+00:00 Traceback\n2022-06-06T12:00:01+00:00 ValueError: bad input\n\n";
        assert_eq!(user_error(stderr), Some("ValueError: bad input".to_string()));
        assert_eq!(user_error("plain message"), Some("plain message".to_string()));
        assert_eq!(user_error("  \n"), None);
    }

    #[test]
    fn test_metrics_query() {
        assert_eq!(
            metrics_query("/aws/sagemaker/TransformJobs", "gc-A-x-00", 60),
            "SEARCH('{/aws/sagemaker/TransformJobs,Host} Host=gc-A-x-00/i-', 'Average', 60)"
        );
    }

    #[test]
    fn test_extract_metric_series_keeps_truncated_results() {
        let response = MetricDataResponse {
            results: vec![
                MetricDataResult {
                    id: "q".to_string(),
                    label: "CPUUtilization".to_string(),
                    status_code: "Complete".to_string(),
                    timestamps: vec![Utc.timestamp_opt(1654516800, 0).unwrap()],
                    values: vec![42.0],
                },
                MetricDataResult {
                    id: "other".to_string(),
                    label: "Ignored".to_string(),
                    status_code: "Complete".to_string(),
                    timestamps: vec![],
                    values: vec![],
                },
            ],
            next_token: Some("more".to_string()),
        };

        let series = extract_metric_series(&response, "q");
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].label, "CPUUtilization");
        assert_eq!(series[0].values, vec![42.0]);
    }
}
