//! Local host identity.

use std::sync::OnceLock;

/// This machine's hostname, resolved once per process. Falls back to
/// `localhost` when the name is unavailable or not valid UTF-8.
pub fn hostname() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| resolve(::hostname::get().ok().and_then(|h| h.into_string().ok())))
}

fn resolve(raw: Option<String>) -> String {
    raw.map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
