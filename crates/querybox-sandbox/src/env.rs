//! Environment handed to worker processes.
//!
//! The worker receives its connection parameters over IPC, so nothing secret
//! needs to reach it through the environment. Only an allow-list of harmless
//! variables survives; credentials and loader or interpreter hooks
//! (`LD_PRELOAD`, `NODE_OPTIONS`, ...) never match it.

/// Variables copied into the worker when present.
const PASSTHROUGH: &[&str] = &[
    "PATH",
    "HOME",
    "TMPDIR",
    "LANG",
    "LC_ALL",
    "TZ",
    "RUST_BACKTRACE",
    "RUST_LOG",
    "QUERYBOX_DEBUG",
];

/// Filter `vars` down to what a worker may inherit.
pub fn sanitize_env<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| PASSTHROUGH.contains(&key.as_str()))
        .collect()
}

/// The current process environment, sanitized.
pub fn sanitized_env() -> Vec<(String, String)> {
    sanitize_env(std::env::vars())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(keys: &[&str]) -> Vec<(String, String)> {
        keys.iter().map(|k| (k.to_string(), "v".to_string())).collect()
    }

    #[test]
    fn only_allow_listed_variables_survive() {
        let kept = sanitize_env(pairs(&[
            "PATH",
            "HOME",
            "LD_PRELOAD",
            "NODE_OPTIONS",
            "ANALYTICS_PG_PASSWORD",
            "ANALYTICS_PG_USER",
            "DATABASE_URL",
            "QUERYBOX_DEBUG",
            "RANDOM_THING",
        ]));
        let keys: Vec<_> = kept.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["PATH", "HOME", "QUERYBOX_DEBUG"]);
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert!(sanitize_env(pairs(&["path", "Home"])).is_empty());
    }
}
