//! Per-session summaries over a collector log.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

const SESSION_EVENTS: [&str; 4] = ["start", "ok", "err", "stop"];
pub const UNKNOWN_USER: &str = "SEM_USER";
/// Label for a missing ambient reading or level name.
pub const NOT_REPORTED: &str = "NÃO INFORMADO";

/// Outcome of one game session as seen by the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub user: String,
    pub src_ip: String,
    pub session: i64,
    pub modo: String,
    pub started_dt: String,
    pub ended_dt: String,
    /// Stop time when present, otherwise start time, otherwise empty.
    pub sort_dt: String,
    pub duration_ms: u64,
    pub ok_total: u64,
    pub err_total: u64,
    pub has_stop: bool,
    pub mic: MicStats,
    /// Hit and miss counts keyed by level name.
    pub by_level: BTreeMap<String, LevelTally>,
}

/// Microphone readings carried by the session's events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MicStats {
    pub count: usize,
    pub avg_hz: Option<f64>,
    pub min_hz: Option<f64>,
    pub max_hz: Option<f64>,
    pub avg_int: Option<f64>,
    pub min_int: Option<f64>,
    pub max_int: Option<f64>,
    pub last: LastMic,
    /// Coarse ambient reading derived from the mean frequency.
    pub ambient: &'static str,
}

/// Most recent value of each microphone field, tracked independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LastMic {
    pub freq: Option<f64>,
    pub int: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelTally {
    pub ok: u64,
    pub err: u64,
}

/// Read a JSONL log, skipping blank or unparseable lines.
pub fn load_events(path: impl AsRef<Path>) -> Result<Vec<Value>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read event log {}", path.display()))?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect())
}

fn text(event: &Value, key: &str) -> String {
    match event.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn int(event: &Value, key: &str) -> Option<i64> {
    match event.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float(event: &Value, key: &str) -> Option<f64> {
    match event.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn event_name(event: &Value) -> String {
    text(event, "event").to_lowercase()
}

fn ambient_label(avg_hz: Option<f64>) -> &'static str {
    match avg_hz {
        None => NOT_REPORTED,
        Some(hz) if hz < 80.0 => "CALMO",
        Some(hz) if hz < 150.0 => "NORMAL",
        Some(_) => "AGITADO",
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn min(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

fn mic_stats(items: &[&Value]) -> MicStats {
    let mut freqs = Vec::new();
    let mut ints = Vec::new();
    let mut last = LastMic::default();
    for event in items {
        if let Some(hz) = float(event, "mic_freq") {
            freqs.push(hz);
            last.freq = Some(hz);
        }
        if let Some(level) = float(event, "mic_int") {
            ints.push(level);
            last.int = Some(level);
        }
        if let Some(kind) = int(event, "mic_type") {
            last.kind = Some(kind);
        }
    }
    let avg_hz = mean(&freqs);
    MicStats {
        count: freqs.len(),
        avg_hz,
        min_hz: min(&freqs),
        max_hz: max(&freqs),
        avg_int: mean(&ints),
        min_int: min(&ints),
        max_int: max(&ints),
        last,
        ambient: ambient_label(avg_hz),
    }
}

fn level_tallies(items: &[&Value]) -> BTreeMap<String, LevelTally> {
    let mut by_level: BTreeMap<String, LevelTally> = BTreeMap::new();
    for event in items {
        let name = event_name(event);
        if name != "ok" && name != "err" {
            continue;
        }
        let mut level = text(event, "modo");
        if level.is_empty() {
            level = text(event, "level");
        }
        if level.is_empty() {
            level = NOT_REPORTED.to_string();
        }
        let tally = by_level.entry(level).or_default();
        if name == "ok" {
            tally.ok += 1;
        } else {
            tally.err += 1;
        }
    }
    by_level
}

/// Group session events by `(user, src_ip, session)` and summarize each group.
/// Output is ordered by that key.
pub fn summarize(events: &[Value]) -> Vec<SessionSummary> {
    let mut groups: BTreeMap<(String, String, i64), Vec<&Value>> = BTreeMap::new();
    for event in events {
        if !SESSION_EVENTS.contains(&event_name(event).as_str()) {
            continue;
        }
        let mut user = text(event, "user");
        if user.is_empty() {
            user = UNKNOWN_USER.to_string();
        }
        let key = (user, text(event, "src_ip"), int(event, "session").unwrap_or(-1));
        groups.entry(key).or_default().push(event);
    }

    groups
        .into_iter()
        .map(|((user, src_ip, session), mut items)| {
            items.sort_by_key(|e| (int(e, "ts").unwrap_or(0), text(e, "dt")));
            summarize_group(user, src_ip, session, &items)
        })
        .collect()
}

fn summarize_group(user: String, src_ip: String, session: i64, items: &[&Value]) -> SessionSummary {
    let start = items.iter().find(|e| event_name(e) == "start");
    let stop = items.iter().rev().find(|e| event_name(e) == "stop");

    let from_stop = |key: &str| {
        stop.and_then(|e| int(e, key))
            .map_or(0, |v| u64::try_from(v).unwrap_or(0))
    };
    let mut ok_total = from_stop("ok_total");
    let mut err_total = from_stop("err_total");
    if stop.is_none() || (ok_total == 0 && err_total == 0) {
        ok_total = items.iter().filter(|e| event_name(e) == "ok").count() as u64;
        err_total = items.iter().filter(|e| event_name(e) == "err").count() as u64;
    }

    let modo = match (start, items.last()) {
        (Some(start), _) => text(start, "modo"),
        (None, Some(last)) => text(last, "modo"),
        (None, None) => String::new(),
    };

    let started_dt = start
        .map(|e| text(e, "dt"))
        .filter(|dt| !dt.is_empty())
        .unwrap_or_else(|| "-".to_string());
    let ended_dt = stop
        .map(|e| text(e, "dt"))
        .filter(|dt| !dt.is_empty())
        .unwrap_or_else(|| "-".to_string());
    let sort_dt = [&ended_dt, &started_dt]
        .into_iter()
        .find(|dt| dt.as_str() != "-")
        .cloned()
        .unwrap_or_default();

    SessionSummary {
        user,
        src_ip,
        session,
        modo,
        started_dt,
        ended_dt,
        sort_dt,
        duration_ms: from_stop("total_ms"),
        ok_total,
        err_total,
        has_stop: stop.is_some(),
        mic: mic_stats(items),
        by_level: level_tallies(items),
    }
}
