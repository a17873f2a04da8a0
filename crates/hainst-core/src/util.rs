//! Small helpers shared by the session engine and the CLI.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

const DIAGNOSTIC_ENV: &str = "HAINST_DIAGNOSTIC";
const DEFAULT_LOG_LIMIT: usize = 160;
const DIAGNOSTIC_LOG_LIMIT: usize = 1024;

/// Lookup results for one value of `PATH`.
#[derive(Default)]
struct PathLookups {
    path: Option<String>,
    found: HashMap<String, bool>,
}

impl PathLookups {
    fn sync(&mut self, path: Option<&str>) {
        if self.path.as_deref() != path {
            self.path = path.map(str::to_string);
            self.found.clear();
        }
    }
}

static PATH_LOOKUPS: OnceLock<Mutex<PathLookups>> = OnceLock::new();

/// Check whether a program can be spawned, e.g. the configured ssh binary.
///
/// Bare names are searched in `PATH`; results are cached until `PATH` changes.
pub fn program_in_path(program: &str) -> bool {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(program).is_file();
    }
    let path = env::var("PATH").ok();
    let lookups = PATH_LOOKUPS.get_or_init(Mutex::default);
    if let Ok(mut lookups) = lookups.lock() {
        lookups.sync(path.as_deref());
        if let Some(found) = lookups.found.get(program) {
            return *found;
        }
    }

    let found = path
        .as_deref()
        .is_some_and(|paths| env::split_paths(paths).any(|dir| dir.join(program).is_file()));

    if let Ok(mut lookups) = lookups.lock() {
        lookups.sync(path.as_deref());
        lookups.found.insert(program.to_string(), found);
    }
    found
}

/// True when `HAINST_DIAGNOSTIC` asks for verbose command output in logs.
pub fn diagnostic_mode() -> bool {
    is_enabled(env::var(DIAGNOSTIC_ENV).ok().as_deref())
}

fn is_enabled(value: Option<&str>) -> bool {
    matches!(
        value.map(|value| value.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn log_limit(diagnostic: bool) -> usize {
    if diagnostic {
        DIAGNOSTIC_LOG_LIMIT
    } else {
        DEFAULT_LOG_LIMIT
    }
}

/// Flatten remote output onto one line and cap it at `max_len` characters.
pub fn sanitize_log_value(value: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }
    let mut chars = value
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch });
    let cleaned: String = chars.by_ref().take(max_len).collect();
    let cleaned = cleaned.trim();
    if chars.next().is_some() {
        format!("{cleaned}...")
    } else {
        cleaned.to_string()
    }
}

/// Remote output shortened for a log field.
pub fn log_snippet(value: &str) -> String {
    sanitize_log_value(value, log_limit(diagnostic_mode()))
}

/// Last `count` non-empty lines of command output.
///
/// Package managers print the reason for a failure at the end.
pub fn tail_lines(output: &str, count: usize) -> Vec<&str> {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].to_vec()
}
