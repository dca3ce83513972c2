//! Append-only JSONL provenance journal for plan and apply runs.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Provenance event, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    PlanComputed {
        stack: String,
        run_id: String,
        to_create: u32,
        to_update: u32,
        to_replace: u32,
        to_destroy: u32,
        unchanged: u32,
    },
    ApplyStarted {
        stack: String,
        run_id: String,
        engine_version: String,
    },
    ActionStarted {
        node: String,
        action: String,
    },
    ActionSucceeded {
        node: String,
        action: String,
        duration_seconds: f64,
        hash: Option<String>,
    },
    ActionFailed {
        node: String,
        action: String,
        error: String,
    },
    ActionSkipped {
        node: String,
        blocked_by: String,
    },
    ApplyCompleted {
        stack: String,
        run_id: String,
        converged: u32,
        unchanged: u32,
        failed: u32,
        skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: JournalEvent,
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

fn format_utc(epoch_secs: u64) -> String {
    let days = (epoch_secs / 86_400) as i64;
    let rem = epoch_secs % 86_400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Append one event to the journal at `path`, creating parent directories.
pub fn append_event(path: &Path, event: JournalEvent) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
        }
    }

    let line = serde_json::to_string(&TimestampedEvent {
        ts: now_iso8601(),
        event,
    })
    .map_err(|e| format!("serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    writeln!(file, "{}", line).map_err(|e| format!("cannot write {}: {}", path.display(), e))
}

/// Read every event back from a journal.
pub fn read_events(path: &Path) -> Result<Vec<TimestampedEvent>, String> {
    let file =
        std::fs::File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut events = Vec::new();
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| format!("read error {}: {}", path.display(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: TimestampedEvent = serde_json::from_str(&line)
            .map_err(|e| format!("{}:{}: invalid event: {}", path.display(), n + 1, e))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventlog_format_utc() {
        assert_eq!(format_utc(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_utc(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_utc(1_771_250_400), "2026-02-16T14:00:00Z");
    }

    #[test]
    fn test_eventlog_now_shape() {
        let ts = now_iso8601();
        assert_eq!(ts.len(), 20);
        assert!(ts.contains('T'));
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn test_eventlog_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_eventlog_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("journal.jsonl");
        append_event(
            &path,
            JournalEvent::ApplyStarted {
                stack: "web".to_string(),
                run_id: "r-abc".to_string(),
                engine_version: "0.1.0".to_string(),
            },
        )
        .unwrap();
        append_event(
            &path,
            JournalEvent::ActionFailed {
                node: "alb".to_string(),
                action: "CREATE".to_string(),
                error: "quota exceeded".to_string(),
            },
        )
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"event\":\"apply_started\""));

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].event,
            JournalEvent::ActionFailed { ref node, .. } if node == "alb"
        ));
    }

    #[test]
    fn test_eventlog_read_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(&dir.path().join("none.jsonl")).is_err());
    }
}
