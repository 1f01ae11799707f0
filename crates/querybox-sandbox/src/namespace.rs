//! The script-visible namespace.
//!
//! Scripts never see the real global object. The body is compiled as an async
//! function whose parameters are [`NAMESPACE`]; capabilities are passed in
//! positionally and everything in [`BLOCKED`] is passed as `undefined`, so the
//! parameter shadows whatever the isolate might otherwise resolve.

/// Names bound to real capabilities, in parameter order.
pub const CAPABILITIES: &[&str] = &[
    "db",
    "console",
    "print",
    "sleep",
    "setTimeout",
    "clearTimeout",
    "JSON",
    "Math",
    "Object",
    "Array",
    "String",
    "Number",
    "Boolean",
    "Date",
    "Map",
    "Set",
    "Promise",
    "Error",
    "TypeError",
    "RangeError",
];

/// Names explicitly bound to `undefined`.
///
/// `eval` is absent: strict mode forbids it as a parameter name, so the
/// bootstrap deletes it from the global object instead.
pub const BLOCKED: &[&str] = &[
    "process",
    "require",
    "module",
    "exports",
    "Function",
    "globalThis",
    "global",
    "window",
    "self",
    "Deno",
    "Buffer",
    "fs",
    "path",
    "child_process",
    "__dirname",
    "__filename",
    "setInterval",
    "setImmediate",
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
    "WebAssembly",
    "Reflect",
    "Proxy",
    "SharedArrayBuffer",
    "Atomics",
    "queueMicrotask",
];

/// Every parameter name, capabilities first.
pub fn names() -> Vec<&'static str> {
    CAPABILITIES.iter().chain(BLOCKED).copied().collect()
}

/// Number of lines [`wrap_script_body`] puts in front of the body.
pub const WRAPPER_PREFIX_LINES: u32 = 2;

/// Wrap a script body as the async function the runtime invokes.
pub fn wrap_script_body(body: &str) -> String {
    format!(
        "(async function ({}) {{\n\"use strict\";\n{}\n}})",
        names().join(", "),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique() {
        let all = names();
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), unique.len());
    }

    #[test]
    fn strict_mode_reserved_names_are_not_parameters() {
        let all = names();
        assert!(!all.contains(&"eval"));
        assert!(!all.contains(&"arguments"));
    }

    #[test]
    fn body_starts_after_prefix() {
        let wrapped = wrap_script_body("return 1;");
        let body_line = wrapped.lines().nth(WRAPPER_PREFIX_LINES as usize).unwrap();
        assert_eq!(body_line, "return 1;");
        assert!(wrapped.starts_with("(async function (db, console,"));
    }
}
