//! Helpers for composing remote commands and reading Slurm accounting output.

use std::collections::{BTreeMap, HashSet};

use itertools::Itertools;
use tracing::debug;

use crate::error::RemoteError;
use crate::session::{CommandOutput, Connection};

/// Printed by `sbatch` when it accepts a job.
pub const SUBMISSION_MARKER: &str = "Submitted batch job ";

const SACCT_FIELDS: &str = "jobid,state,elapsed,start,end";

const RUNNING_STATES: &[&str] = &[
    "RUNNING",
    "PENDING",
    "REQUEUED",
    "SUSPENDED",
    "CONFIGURING",
    "COMPLETING",
];

const FAILED_STATES: &[&str] = &[
    "FAILED",
    "TIMEOUT",
    "OUT_OF_MEMORY",
    "NODE_FAIL",
    "BOOT_FAIL",
    "DEADLINE",
    "PREEMPTED",
];

/// One row of `sacct` output, keyed by lower-cased header name.
pub type SacctRecord = BTreeMap<String, String>;

/// Renders `(key, value)` pairs as command line flags, in order.
///
/// One-character keys get `-`, longer keys `--`. Values with whitespace are double-quoted.
/// Values that look like inline JSON must parse first. Quoted values have inner quotes escaped.
/// An empty value renders the bare flag.
pub fn argstring<I, K, V>(params: I) -> Result<String, RemoteError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut args = Vec::new();
    for (key, value) in params {
        let (key, value) = (key.as_ref(), value.as_ref());
        let dash = if key.chars().count() == 1 { "-" } else { "--" };
        let flag = format!("{}{}", dash, key);
        if value.is_empty() {
            args.push(flag);
            continue;
        }
        let trimmed = value.trim_start();
        let rendered = if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str::<serde_json::Value>(value).map_err(|e| {
                RemoteError::InvalidArgument(format!("value of '{}' is not valid JSON: {}", key, e))
            })?;
            format!("\"{}\"", value.replace('"', "\\\""))
        } else if value.chars().any(char::is_whitespace) {
            format!("\"{}\"", value.replace('"', "\\\""))
        } else {
            value.to_string()
        };
        args.push(format!("{} {}", flag, rendered));
    }
    Ok(args.iter().join(" "))
}

/// Quotes `s` for a POSIX shell. Strings made only of safe characters pass through.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

async fn run_waited(connection: &dyn Connection, cmd: &str) -> Result<CommandOutput, RemoteError> {
    connection
        .run_command(cmd, true)
        .await?
        .ok_or_else(|| RemoteError::Protocol(format!("no output for '{}'", cmd)))
}

/// SHA-256 of a remote file.
///
/// Anything on stderr means the checksum could not be trusted and is reported as a timeout.
pub async fn remote_hash(connection: &dyn Connection, path: &str) -> Result<String, RemoteError> {
    let output = run_waited(connection, &format!("sha256sum {}", shell_quote(path))).await?;
    if !output.stderr.is_empty() {
        return Err(RemoteError::Timeout(format!(
            "checksum of {} on {}: {}",
            path,
            connection.host(),
            output.stderr
        )));
    }
    output
        .stdout
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Protocol(format!("empty checksum output for {}", path)))
}

/// Queries Slurm accounting for `job_ids`.
pub async fn sacct<S: AsRef<str>>(
    connection: &dyn Connection,
    job_ids: &[S],
) -> Result<Vec<SacctRecord>, RemoteError> {
    if job_ids.is_empty() {
        return Ok(vec![]);
    }
    let ids = job_ids.iter().map(|id| shell_quote(id.as_ref())).join(",");
    let cmd = format!("sacct -P -j {} --format={}", ids, SACCT_FIELDS);
    let output = run_waited(connection, &cmd).await?;
    parse_sacct(&output.stdout, &output.stderr)
}

/// Parses pipe-delimited `sacct -P` output. The first line is the header.
pub fn parse_sacct(stdout: &str, stderr: &str) -> Result<Vec<SacctRecord>, RemoteError> {
    if !stderr.trim().is_empty() {
        return Err(RemoteError::SchedulerQuery(stderr.trim().to_string()));
    }
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let header: Vec<String> = match lines.next() {
        Some(line) => line.split('|').map(|f| f.trim().to_lowercase()).collect(),
        None => {
            return Err(RemoteError::SchedulerQuery(
                "sacct printed no header".to_string(),
            ))
        }
    };
    if !header.iter().any(|f| f == "state") {
        return Err(RemoteError::SchedulerQuery(format!(
            "sacct header has no state column: {}",
            header.join("|")
        )));
    }

    let mut records = Vec::new();
    for line in lines {
        let values: Vec<&str> = line.split('|').collect();
        if values.len() != header.len() {
            return Err(RemoteError::SchedulerQuery(format!(
                "expected {} fields, got {}: {}",
                header.len(),
                values.len(),
                line
            )));
        }
        records.push(
            header
                .iter()
                .cloned()
                .zip(values.into_iter().map(str::to_string))
                .collect(),
        );
    }
    debug!(records = records.len(), "parsed sacct output");
    Ok(records)
}

fn state(record: &SacctRecord) -> &str {
    record.get("state").map(String::as_str).unwrap_or("")
}

fn is_running(record: &SacctRecord) -> bool {
    RUNNING_STATES.contains(&state(record))
}

fn is_failed(record: &SacctRecord) -> bool {
    FAILED_STATES.contains(&state(record))
}

fn is_cancelled(record: &SacctRecord) -> bool {
    state(record).starts_with("CANCELLED")
}

pub fn any_running(records: &[SacctRecord]) -> bool {
    records.iter().any(is_running)
}

pub fn all_complete(records: &[SacctRecord]) -> bool {
    records.iter().all(|r| state(r) == "COMPLETED")
}

pub fn any_failed(records: &[SacctRecord]) -> bool {
    records.iter().any(is_failed)
}

pub fn all_failed(records: &[SacctRecord]) -> bool {
    records.iter().all(is_failed)
}

/// Every job reached a terminal state: completed, failed, or cancelled.
pub fn all_done(records: &[SacctRecord]) -> bool {
    records
        .iter()
        .all(|r| state(r) == "COMPLETED" || is_failed(r) || is_cancelled(r))
}

/// Job ids that logs report as submitted, other than `job_id` itself.
///
/// Ordered by log name, then position in the log, without duplicates.
pub fn find_submitted_jobs(job_id: &str, logs: &BTreeMap<String, String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for text in logs.values() {
        for (start, _) in text.match_indices(SUBMISSION_MARKER) {
            let rest = &text[start + SUBMISSION_MARKER.len()..];
            let id: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if !id.is_empty() && id != job_id && seen.insert(id.clone()) {
                found.push(id);
            }
        }
    }
    found
}

/// Reads remote log files. Files that cannot be read are left out.
pub async fn fetch_logs<S: AsRef<str>>(
    connection: &dyn Connection,
    paths: &[S],
) -> Result<BTreeMap<String, String>, RemoteError> {
    let mut logs = BTreeMap::new();
    for path in paths {
        let path = path.as_ref();
        let output = run_waited(connection, &format!("cat {}", shell_quote(path))).await?;
        if output.success() {
            logs.insert(path.to_string(), output.stdout);
        } else {
            debug!(path, stderr = %output.stderr, "skipping unreadable log");
        }
    }
    Ok(logs)
}
