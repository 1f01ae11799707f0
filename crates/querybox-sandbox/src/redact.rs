//! Credential redaction for messages that leave the worker.
//!
//! Database drivers like to echo connection strings, hosts, and file paths in
//! their errors. Everything that becomes an `error` output item or an
//! [`ErrorInfo`](crate::result::ErrorInfo) message passes through
//! [`redact_error_message`] first.

use std::sync::LazyLock;

use regex::Regex;

static CONNECTION_STRING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(postgres(ql)?|mongodb(\+srv)?)://[^\s'")\]}>]+"#).unwrap()
});

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bhttps?://[^\s'")\]}>]+"#).unwrap());

static IP_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?\b").unwrap());

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|run|nix)(/[\w.\-]+)+").unwrap()
});

// libpq keyword/value pairs and the usual token spellings.
static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(password|passwd|pwd|secret|token|api_key|user)\s*[=:]\s*[^\s,;]+").unwrap()
});

static AWS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b").unwrap());

/// Strip connection strings, URLs, addresses, credentials, and file paths.
///
/// Backend codes, SQL keywords, and relation names survive so the message
/// stays actionable.
pub fn redact_error_message(message: &str) -> String {
    let msg = CONNECTION_STRING_RE.replace_all(message, "[connection-string]");
    let msg = AWS_KEY_RE.replace_all(&msg, "[REDACTED]");
    let msg = CREDENTIAL_RE.replace_all(&msg, "$1=[REDACTED]");
    let msg = URL_RE.replace_all(&msg, "[url]");
    let msg = IP_PORT_RE.replace_all(&msg, "[addr]");
    UNIX_PATH_RE.replace_all(&msg, "[path]").into_owned()
}
