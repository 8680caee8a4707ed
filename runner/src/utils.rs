//! Utility functions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Version information for the runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Quote a value for a POSIX shell.
///
/// Values made only of safe characters pass through untouched, anything else
/// is wrapped in single quotes with embedded quotes spliced as `'\''`.
pub fn shell_escape(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Split on `sep` into at most `limit` parts, the last part keeps the rest.
///
/// Runs of separators count as one, mirroring how directive strings are typed
/// by hand.
pub fn split_limit(value: &str, sep: char, limit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = value.trim_start_matches(sep);
    while !rest.is_empty() {
        if parts.len() + 1 == limit {
            parts.push(rest.to_string());
            break;
        }
        match rest.split_once(sep) {
            Some((head, tail)) => {
                parts.push(head.to_string());
                rest = tail.trim_start_matches(sep);
            }
            None => {
                parts.push(rest.to_string());
                break;
            }
        }
    }
    parts
}

/// Database name owned by `user`, `<user>_<name>` with unsafe characters
/// folded into underscores.
pub fn db_name(user: &str, name: &str) -> String {
    let raw = format!("{}_{}", user, name);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exp_backoff() {
        let options = CooldownOptions {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        };

        assert_eq!(calc_exp_backoff(&options, 0), Duration::from_secs(1));
        assert_eq!(calc_exp_backoff(&options, 1), Duration::from_secs(2));
        assert_eq!(calc_exp_backoff(&options, 2), Duration::from_secs(4));
        assert_eq!(calc_exp_backoff(&options, 10), Duration::from_secs(300));
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("main"), "main");
        assert_eq!(
            shell_escape("https://example.com/app.zip"),
            "https://example.com/app.zip"
        );
        assert_eq!(shell_escape("my dir"), "'my dir'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_split_limit() {
        assert_eq!(split_limit("php 8.3", ' ', 2), vec!["php", "8.3"]);
        assert_eq!(
            split_limit("add TXT @ v=spf1 include:x ~all", ' ', 4),
            vec!["add", "TXT", "@", "v=spf1 include:x ~all"]
        );
        assert_eq!(split_limit("ssl", ' ', 2), vec!["ssl"]);
        assert!(split_limit("", ' ', 2).is_empty());
    }

    #[test]
    fn test_db_name() {
        assert_eq!(db_name("alice", "db"), "alice_db");
        assert_eq!(db_name("alice", "blog-v2"), "alice_blog_v2");
    }
}
