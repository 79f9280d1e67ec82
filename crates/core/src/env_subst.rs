//! `${KEY}` placeholder substitution for configuration values.
//!
//! Placeholders are resolved from the process environment. A placeholder whose
//! variable is unset or blank is an error; text outside placeholders is kept
//! verbatim.

use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::debug;

use crate::errors::ConfigError;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder regex is valid"))
}

/// Replace every `${KEY}` in `input` with the value of environment variable `KEY`.
pub fn resolve(input: &str) -> Result<String, ConfigError> {
    resolve_with(input, |key| std::env::var(key).ok())
}

/// Like [`resolve`], with a caller-supplied lookup.
pub fn resolve_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(input) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let key = key.as_str().trim();
        let value = lookup(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::PlaceholderUnresolved(key.to_string()))?;
        debug!(key, "resolved placeholder");
        out.push_str(&input[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Strip placeholder syntax for log messages (`${FOO}` -> `FOO`).
pub fn bare_key(input: &str) -> String {
    input.replace(['$', '{', '}'], "")
}
