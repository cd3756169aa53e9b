// Cleanup and noise filtering for tailscaled output lines

use tailproxy_common::LogLevel;

/// Tracing target under which daemon output is re-logged
pub const DAEMON_LOG_TARGET: &str = "tailscaled";

/// Substrings of chatty subsystems hidden above debug level
pub const NOISE_KEYWORDS: &[&str] = &[
    "magicsock",
    "netcheck",
    "ratelimit",
    "udp proxy: received",
    "logtail",
];

/// Substrings kept at the error level
pub const ERROR_MARKERS: &[&str] = &["error", "fail", "panic", "fatal"];

// Length of "YYYY/MM/DD HH:MM:SS "
const TIMESTAMP_PREFIX_LEN: usize = 20;

/// Strip the daemon's own `YYYY/MM/DD HH:MM:SS ` prefix
pub fn clean_line(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() > TIMESTAMP_PREFIX_LEN
        && bytes[4] == b'/'
        && bytes[7] == b'/'
        && bytes[13] == b':'
        && line.is_char_boundary(TIMESTAMP_PREFIX_LEN)
    {
        &line[TIMESTAMP_PREFIX_LEN..]
    } else {
        line
    }
}

/// Decide whether an already cleaned line is forwarded at `level`
pub fn should_forward(level: LogLevel, line: &str) -> bool {
    if level == LogLevel::Debug {
        return true;
    }

    let lower = line.to_lowercase();
    if NOISE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return false;
    }

    match level {
        LogLevel::Error => ERROR_MARKERS.iter().any(|m| lower.contains(m)),
        _ => true,
    }
}

/// Clean, filter and log one daemon output line
pub fn forward_line(level: LogLevel, raw: &str) {
    let line = clean_line(raw.trim_end_matches(&['\r', '\n'][..]));
    if should_forward(level, line) {
        tracing::info!(target: DAEMON_LOG_TARGET, "{}", line);
    }
}
