use chrono::{DateTime, Utc};

pub const WARNING_THRESHOLD: f64 = 70.0;
pub const CRITICAL_THRESHOLD: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Ok,
    Warning,
    Critical,
}

impl StatusLevel {
    pub fn from_value(value: f64) -> Self {
        Self::with_thresholds(value, WARNING_THRESHOLD, CRITICAL_THRESHOLD)
    }

    pub fn with_thresholds(value: f64, warning: f64, critical: f64) -> Self {
        if value >= critical {
            StatusLevel::Critical
        } else if value >= warning {
            StatusLevel::Warning
        } else {
            StatusLevel::Ok
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            StatusLevel::Ok => " ",
            StatusLevel::Warning => "!",
            StatusLevel::Critical => "‼",
        }
    }
}

pub fn format_bytes(bytes: Option<i64>) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let Some(bytes) = bytes else {
        return "N/A".to_string();
    };
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

pub fn format_percentage(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}%"),
        None => "N/A".to_string(),
    }
}

pub fn format_time_ago(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(ts).num_seconds();
    if secs < 1 {
        return "just now".to_string();
    }
    let (n, unit) = if secs < 60 {
        (secs, "second")
    } else if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86_400 {
        (secs / 3600, "hour")
    } else {
        (secs / 86_400, "day")
    };
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}
