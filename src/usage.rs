use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Max lines to keep in usage-session.jsonl (one line per session).
const MAX_SESSION_LOG_LINES: usize = 500;

/// Counters for one session, written as a single JSON line when it ends.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct SessionUsage {
    pub client_id: String,
    pub server_url: String,
    pub bytes_sent: u64,
    pub ms_sent: u64,
    pub chunks_sent: u64,
    pub utterances: u64,
    pub turns: u64,
    pub interrupts: u64,
    pub reconnects: u64,
    pub errors: u64,
    pub started_ms: i64,
    pub ended_ms: i64,
}

pub fn session_usage_path() -> Result<PathBuf, String> {
    crate::settings::data_dir()
        .map(|dir| dir.join("usage-session.jsonl"))
        .ok_or_else(|| "Failed to resolve data directory for usage logs".to_string())
}

pub fn append_usage_line<T: Serialize>(path: &Path, usage: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create usage dir: {}", e))?;
    }
    let mut text =
        serde_json::to_string(usage).map_err(|e| format!("Failed to serialize usage: {}", e))?;
    text.push('\n');
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, text.as_bytes()))
        .map_err(|e| format!("Failed to append usage log: {}", e))?;
    truncate_log(path, MAX_SESSION_LOG_LINES);
    Ok(())
}

/// If `path` has more than `max_lines` lines, rewrite it keeping only the last `max_lines`.
fn truncate_log(path: &Path, max_lines: usize) {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return,
    };
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return;
    }
    let keep = &lines[lines.len() - max_lines..];
    let mut out = keep.join("\n");
    out.push('\n');
    let _ = fs::write(path, out.as_bytes());
}

/// The most recent `max` sessions from `path`, newest first.
pub fn load_recent_sessions(path: &Path, max: usize) -> Vec<SessionUsage> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return vec![],
    };
    text.lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .take(max)
        .collect()
}
