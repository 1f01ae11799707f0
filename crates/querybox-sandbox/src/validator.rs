//! Pre-execution script validator.
//!
//! A best-effort blocklist over raw script text plus a syntax pre-check. The
//! worker process and the restricted namespace are the real boundary; these
//! checks stop obvious escape attempts before a process is ever spawned and
//! flag destructive statements for reviewers.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::result::ErrorKind;
use crate::syntax::{check_syntax, SyntaxIssue};

/// Default maximum script size in bytes (256 KB).
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 256 * 1024;

/// Threat family of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Code generation, module loading, process control.
    Rce,
    /// Host filesystem access.
    Filesystem,
    /// Outbound network access.
    Network,
    /// Prototype-chain and global-object escapes.
    Prototype,
    /// Destructive database statements. Warning only.
    Destructive,
}

struct Signature {
    regex: Regex,
    source: &'static str,
    message: &'static str,
    is_error: bool,
    category: Category,
}

/// A blocking signature that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedSignature {
    /// Regex source of the signature.
    pub pattern: String,
    /// Human-readable reason.
    pub message: String,
    /// Threat family.
    pub category: Category,
}

/// Outcome of validating one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// `true` iff `errors` is empty.
    pub valid: bool,
    /// Blocking problems.
    pub errors: Vec<String>,
    /// Non-blocking notices (destructive operations).
    pub warnings: Vec<String>,
    /// Every blocking signature that matched.
    pub blocked_signatures: Vec<BlockedSignature>,
    /// The syntax problem, if the body failed to parse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syntax_error: Option<SyntaxIssue>,
}

impl ValidationResult {
    fn finish(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
            blocked_signatures: Vec::new(),
            syntax_error: None,
        }
    }

    /// Error kind reported when this result rejects a request.
    pub fn failure_kind(&self) -> ErrorKind {
        if self.syntax_error.is_some() && self.errors.len() == 1 {
            ErrorKind::Syntax
        } else {
            ErrorKind::Validation
        }
    }
}

// (pattern, message, is_error, category). Case-insensitive unless the pattern
// opts out with `(?-i:...)`.
const TABLE: &[(&str, &str, bool, Category)] = &[
    // rce
    (r"\beval\s*\(", "Direct eval() is not allowed", true, Category::Rce),
    (r"\bnew\s+Function\b", "The Function constructor is not allowed", true, Category::Rce),
    (r"(?-i:\bFunction)\s*\(", "The Function constructor is not allowed", true, Category::Rce),
    (r"\bimport\s*\(", "Dynamic import() is not allowed", true, Category::Rce),
    (r"\brequire\s*\(", "require() is not allowed", true, Category::Rce),
    (r"child_process", "child_process access is not allowed", true, Category::Rce),
    (r"\b(execSync|spawnSync|execFile)\b", "Process spawning is not allowed", true, Category::Rce),
    (r"\bDeno\s*\.", "Runtime internals are not accessible", true, Category::Rce),
    (
        r"\bprocess\s*\.\s*(env|exit|argv|binding|kill|mainModule|stdin|stdout|stderr)\b",
        "process access is not allowed",
        true,
        Category::Rce,
    ),
    (r"\bprocess\s*\[", "process access is not allowed", true, Category::Rce),
    // prototype
    (r"constructor\s*\.\s*constructor", "Constructor chain traversal is not allowed", true, Category::Prototype),
    (r"constructor\s*\[", "Computed constructor access is not allowed", true, Category::Prototype),
    (r"\bglobalThis\b", "globalThis access is not allowed", true, Category::Prototype),
    (r"\bReflect\s*\.", "The Reflect API is not allowed", true, Category::Prototype),
    (r"String\s*\.\s*fromCharCode", "String.fromCharCode is not allowed", true, Category::Prototype),
    (r"__proto__", "__proto__ access is not allowed", true, Category::Prototype),
    (r"Object\s*\.\s*setPrototypeOf", "Prototype mutation is not allowed", true, Category::Prototype),
    (
        r"defineProperty\s*\(\s*Object\s*\.\s*prototype",
        "Modifying Object.prototype is not allowed",
        true,
        Category::Prototype,
    ),
    (r"__(define|lookup)(Getter|Setter)__", "Legacy accessor APIs are not allowed", true, Category::Prototype),
    // filesystem
    (r"\bfs\s*\.", "Filesystem access is not allowed", true, Category::Filesystem),
    (
        r"\b(readFileSync|writeFileSync|appendFileSync|readdirSync|unlinkSync|rmdirSync|unlink|rmdir)\s*\(",
        "Filesystem access is not allowed",
        true,
        Category::Filesystem,
    ),
    (r"__dirname|__filename", "Filesystem paths are not accessible", true, Category::Filesystem),
    // network
    (r"\bfetch\s*\(", "Network access (fetch) is not allowed", true, Category::Network),
    (r"XMLHttpRequest", "Network access (XMLHttpRequest) is not allowed", true, Category::Network),
    (r"\bWebSocket\b", "Network access (WebSocket) is not allowed", true, Category::Network),
    (r"\bhttps?\s*\.\s*(request|get)\s*\(", "Network access (http) is not allowed", true, Category::Network),
    (
        r"\bnet\s*\.\s*(connect|createConnection|createServer)\b",
        "Raw socket access is not allowed",
        true,
        Category::Network,
    ),
    (r"\bdgram\b", "Raw socket access is not allowed", true, Category::Network),
    // destructive
    (r"\.\s*drop\s*\(", "Script drops a collection", false, Category::Destructive),
    (r"\bdropDatabase\s*\(", "Script drops a database", false, Category::Destructive),
    (
        r"\bdeleteMany\s*\(\s*(\{\s*\})?\s*[,)]",
        "deleteMany with an empty filter removes every document",
        false,
        Category::Destructive,
    ),
    (
        r"\bupdateMany\s*\(\s*\{\s*\}",
        "updateMany with an empty filter modifies every document",
        false,
        Category::Destructive,
    ),
    (r"\bDROP\s+(TABLE|DATABASE|SCHEMA)\b", "Script drops a table, database, or schema", false, Category::Destructive),
    (r"\bTRUNCATE\b", "Script truncates a table", false, Category::Destructive),
    (
        r#"\bDELETE\s+FROM\s+[\w."]+\s*(;|'|`|\)|$)"#,
        "DELETE FROM without WHERE removes every row",
        false,
        Category::Destructive,
    ),
];

static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    TABLE
        .iter()
        .map(|&(source, message, is_error, category)| Signature {
            regex: RegexBuilder::new(source)
                .case_insensitive(true)
                .multi_line(true)
                .build()
                .unwrap(),
            source,
            message,
            is_error,
            category,
        })
        .collect()
});

/// Validate a script body against the default size limit.
pub fn validate(script: &str) -> ValidationResult {
    validate_with_limit(script, DEFAULT_MAX_SCRIPT_SIZE)
}

/// Validate a script body.
///
/// Pure: identical input always yields an identical result.
pub fn validate_with_limit(script: &str, max_size: usize) -> ValidationResult {
    if script.trim().is_empty() {
        return ValidationResult::finish(vec!["Script is empty".into()], Vec::new());
    }
    if script.len() > max_size {
        return ValidationResult::finish(
            vec![format!(
                "Script is too large ({} bytes, max {max_size} bytes)",
                script.len()
            )],
            Vec::new(),
        );
    }

    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut blocked_signatures = Vec::new();

    let syntax_error = check_syntax(script).err();
    if let Some(issue) = &syntax_error {
        errors.push(issue.to_string());
    }

    for sig in SIGNATURES.iter() {
        if !sig.regex.is_match(script) {
            continue;
        }
        if sig.is_error {
            errors.push(format!("{} ({})", sig.message, category_name(sig.category)));
            blocked_signatures.push(BlockedSignature {
                pattern: sig.source.to_string(),
                message: sig.message.to_string(),
                category: sig.category,
            });
        } else {
            warnings.push(sig.message.to_string());
        }
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
        blocked_signatures,
        syntax_error,
    }
}

fn category_name(category: Category) -> &'static str {
    match category {
        Category::Rce => "rce",
        Category::Filesystem => "filesystem",
        Category::Network => "network",
        Category::Prototype => "prototype",
        Category::Destructive => "destructive",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(script: &str) -> ValidationResult {
        let result = validate(script);
        assert!(!result.valid, "expected {script:?} to be blocked");
        assert!(!result.errors.is_empty());
        result
    }

    #[test]
    fn accepts_plain_query_script() {
        let script = r#"const res = await db.query("SELECT id FROM users WHERE active = $1", [true]);
return res.rowCount;"#;
        let result = validate(script);
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn rejects_empty_script() {
        assert!(!validate("").valid);
        assert!(!validate("  \n\t ").valid);
    }

    #[test]
    fn rejects_oversized_script() {
        let script = format!("return {};", "1".repeat(100));
        let result = validate_with_limit(&script, 50);
        assert!(!result.valid);
        assert!(result.errors[0].contains("too large"));
        assert!(validate_with_limit(&script, 1000).valid);
    }

    #[test]
    fn rejects_eval_in_any_case() {
        let result = blocked(r#"return eval("1+1");"#);
        assert_eq!(result.blocked_signatures[0].category, Category::Rce);
        blocked(r#"return EVAL ("1+1");"#);
    }

    #[test]
    fn rejects_function_constructor_but_not_function_expressions() {
        blocked(r#"return Function("return 1")();"#);
        blocked(r#"return new Function("return 1")();"#);

        let result = validate("const f = function (x) { return x; };\nreturn [1].map(function(y) { return f(y); });");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn rejects_process_and_require() {
        blocked("return process.env.DATABASE_URL;");
        blocked(r#"return process["env"];"#);
        blocked(r#"const cp = require("child_process");"#);
    }

    #[test]
    fn allows_process_as_data_field() {
        let result = validate("const row = { process: { status: 'ok' } };\nreturn row.process.status;");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn rejects_prototype_escapes() {
        blocked(r#"return "".constructor.constructor("return this")();"#);
        blocked(r#"return ({}).__proto__;"#);
        blocked(r#"return globalThis.db;"#);
        blocked("return Reflect.ownKeys(db);");
        blocked("return String.fromCharCode(101, 118, 97, 108);");
    }

    #[test]
    fn rejects_filesystem_and_network() {
        let result = blocked(r#"return fs.readFileSync("/etc/passwd");"#);
        assert!(result
            .blocked_signatures
            .iter()
            .all(|s| s.category == Category::Filesystem));
        let result = blocked(r#"return await fetch("http://example.com");"#);
        assert_eq!(result.blocked_signatures[0].category, Category::Network);
        blocked(r#"const ws = new WebSocket("ws://x");"#);
    }

    #[test]
    fn constructor_name_is_allowed() {
        let result = validate("const obj = {};\nreturn obj.constructor.name;");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn destructive_operations_only_warn() {
        let result = validate("await db.collection('users').deleteMany({});\nreturn 1;");
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("deleteMany"));

        let result = validate(r#"await db.execute("DELETE FROM sessions");"#);
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("without WHERE")));

        let result = validate(r#"await db.execute("DROP TABLE audit; TRUNCATE logs;");"#);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn scoped_deletes_do_not_warn() {
        let result = validate(
            "await db.collection('users').deleteMany({ active: false });\nawait db.execute(\"DELETE FROM sessions WHERE expired = true\");",
        );
        assert!(result.valid);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn syntax_errors_are_blocking_and_carry_a_line() {
        let result = validate("const x = 1;\nreturn x +;");
        assert!(!result.valid);
        let issue = result.syntax_error.as_ref().unwrap();
        assert_eq!(issue.line, Some(2));
        assert_eq!(result.failure_kind(), ErrorKind::Syntax);
    }

    #[test]
    fn signature_failures_report_validation_kind() {
        let result = blocked(r#"return eval("x");"#);
        assert_eq!(result.failure_kind(), ErrorKind::Validation);
    }

    #[test]
    fn validation_is_idempotent() {
        let script = "await db.collection('a').drop();\nreturn fetch('x');";
        assert_eq!(validate(script), validate(script));
    }
}
