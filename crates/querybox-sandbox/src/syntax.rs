//! Syntax pre-check for script bodies.
//!
//! Parses the body with `oxc_parser` exactly as the runtime will compile it,
//! so a script that would fail to compile is rejected before any process is
//! spawned.

use oxc_allocator::Allocator;
use oxc_ast::ast::{Expression, Program, Statement};
use oxc_parser::Parser;
use oxc_span::SourceType;

use crate::namespace::{wrap_script_body, WRAPPER_PREFIX_LINES};

/// Maximum bracket nesting depth accepted before parsing.
const MAX_NESTING_DEPTH: usize = 256;

/// A syntax problem found in a script body.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SyntaxIssue {
    /// 1-based line within the script body, when the parser reported a span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Parser message.
    pub message: String,
}

impl std::fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "SyntaxError at line {line}: {}", self.message),
            None => write!(f, "SyntaxError: {}", self.message),
        }
    }
}

/// Reject pathologically nested input before handing it to the parser.
pub fn check_nesting_depth(code: &str) -> Result<(), SyntaxIssue> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for ch in code.chars() {
        match ch {
            '{' | '[' | '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        return Err(SyntaxIssue {
            line: None,
            message: format!("nesting depth {max_depth} exceeds maximum {MAX_NESTING_DEPTH}"),
        });
    }
    Ok(())
}

/// Parse `body` as the inside of the sandbox's async function.
pub fn check_syntax(body: &str) -> Result<(), SyntaxIssue> {
    check_nesting_depth(body)?;

    let wrapped = wrap_script_body(body);
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, &wrapped, SourceType::mjs()).parse();

    if ret.panicked && ret.errors.is_empty() {
        return Err(SyntaxIssue {
            line: None,
            message: "parser could not recover from malformed input".into(),
        });
    }

    let Some(err) = ret.errors.first() else {
        if !is_single_function(&ret.program) {
            return Err(SyntaxIssue {
                line: None,
                message: "script body closes the enclosing function".into(),
            });
        }
        return Ok(());
    };

    let line = err
        .labels
        .as_ref()
        .and_then(|labels| labels.first())
        .map(|label| line_of(&wrapped, label.offset()))
        .and_then(|line| line.checked_sub(WRAPPER_PREFIX_LINES))
        .filter(|line| *line > 0);

    Err(SyntaxIssue {
        line,
        message: err.message.to_string(),
    })
}

/// The wrapped program must be exactly one (parenthesized) function
/// expression; anything else means the body broke out of the wrapper.
fn is_single_function(program: &Program<'_>) -> bool {
    let [Statement::ExpressionStatement(stmt)] = &program.body[..] else {
        return false;
    };
    let mut expr = &stmt.expression;
    while let Expression::ParenthesizedExpression(paren) = expr {
        expr = &paren.expression;
    }
    matches!(expr, Expression::FunctionExpression(_))
}

/// 1-based line number of a byte offset.
fn line_of(text: &str, offset: usize) -> u32 {
    let end = offset.min(text.len());
    let newlines = text.as_bytes()[..end].iter().filter(|b| **b == b'\n').count();
    newlines as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_body() {
        assert!(check_syntax("return 1 + 1;").is_ok());
        assert!(check_syntax("const rows = await db.query('SELECT 1');\nreturn rows;").is_ok());
    }

    #[test]
    fn accepts_arrow_and_function_expressions() {
        let body = "const f = function (x) { return x; };\nconst g = (y) => y * 2;\nreturn f(g(2));";
        assert!(check_syntax(body).is_ok());
    }

    #[test]
    fn reports_line_relative_to_body() {
        let body = "const a = 1;\nconst b = ;\nreturn a;";
        let issue = check_syntax(body).unwrap_err();
        assert_eq!(issue.line, Some(2));
        assert!(!issue.message.is_empty());
        assert!(issue.to_string().starts_with("SyntaxError at line 2"));
    }

    #[test]
    fn rejects_unbalanced_braces() {
        assert!(check_syntax("if (true) {\nreturn 1;").is_err());
    }

    #[test]
    fn rejects_bodies_that_escape_the_wrapper() {
        for body in [
            "return 1; }), this.x, (function () {",
            "return 1; }); this.x; (function () {",
            "return 1; })\n(function () {",
        ] {
            let issue = check_syntax(body).unwrap_err();
            assert!(issue.message.contains("enclosing function"), "{body}: {issue}");
        }
    }

    #[test]
    fn nesting_depth_limit() {
        assert!(check_nesting_depth("{[()]}").is_ok());
        let deep = format!("{}{}", "(".repeat(300), ")".repeat(300));
        let issue = check_nesting_depth(&deep).unwrap_err();
        assert!(issue.message.contains("300"));
        assert!(check_syntax(&deep).is_err());
    }
}
