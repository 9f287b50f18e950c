//! Code AST - the opaque-parser boundary
//!
//! The DAG builder consumes a [`Program`]: a statement-level view of the user
//! code, already normalised to the recognised operation set. Producing it is
//! the job of a [`CodeParser`]; the bundled [`SourceScanner`] recognises:
//!
//! - External calls `mcp.<server>.<tool>(args)`
//! - Capability invocations `capabilities.<name>(args)`
//! - Whitelisted pure method calls (filter, map, reduce, …, `Object.keys`,
//!   `JSON.parse`, `Math.*`) with exact source spans
//! - Loops (`for`, `for-of`, `for-in`, `while`, `do-while`) with their body
//! - Conditionals (`if`/`else`)
//! - `Promise.all([...])` fan-out
//!
//! Spans are byte offsets into the original source; comments are blanked out
//! before scanning so spans survive verbatim extraction.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{PmlError, Result};

/// Byte range into the original source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

/// Loop flavour, preserved for the `loop:<type>` trace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopType {
    For,
    ForOf,
    ForIn,
    While,
    DoWhile,
}

impl LoopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopType::For => "for",
            LoopType::ForOf => "forOf",
            LoopType::ForIn => "forIn",
            LoopType::While => "while",
            LoopType::DoWhile => "doWhile",
        }
    }
}

/// A single whitelisted pure call inside an expression chain.
///
/// `nesting` counts enclosing call parentheses: 0 is a chain link, anything
/// deeper was found inside another operation's callback.
#[derive(Debug, Clone, PartialEq)]
pub struct PureOp {
    /// Operation name, e.g. "map", "reduce", "parse"
    pub op: String,
    /// Span from the chain start through this call's closing paren
    pub span: Span,
    pub nesting: u8,
}

/// Head of an expression: what the (possibly empty) chain of pure ops hangs
/// off.
#[derive(Debug, Clone, PartialEq)]
pub enum Head {
    /// `mcp.<server>.<tool>(args)`
    Mcp {
        server: String,
        tool: String,
        args: String,
        span: Span,
    },
    /// `capabilities.<name>(args)`
    Capability {
        name: String,
        args: String,
        span: Span,
    },
    /// `Promise.all([...])` - branches become siblings of a common parent
    FanOut(Vec<Expr>),
    /// Identifier, literal, or anything else the scanner does not interpret
    Value,
}

/// An expression: a head plus a chain of pure operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub head: Head,
    pub ops: Vec<PureOp>,
    pub span: Span,
}

impl Expr {
    pub fn opaque(span: Span) -> Self {
        Self {
            head: Head::Value,
            ops: Vec::new(),
            span,
        }
    }

    /// True when the scanner found nothing it understands.
    pub fn is_opaque(&self) -> bool {
        matches!(self.head, Head::Value) && self.ops.is_empty()
    }
}

/// Loop statement with its body analysed once.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStmt {
    pub loop_type: LoopType,
    /// Header text inside the parens (or the while-condition for do-while)
    pub condition: String,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// Conditional statement.
#[derive(Debug, Clone, PartialEq)]
pub struct IfStmt {
    pub condition: String,
    pub then_branch: Vec<Stmt>,
    pub else_branch: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `const <name> = <expr>;`
    Binding { name: String, expr: Expr },
    /// Bare expression statement
    Bare { expr: Expr },
    /// `return <expr>;`
    Return { expr: Option<Expr> },
    Loop(LoopStmt),
    If(IfStmt),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub span: Span,
    pub kind: StmtKind,
}

/// Statement-level view of a piece of user code.
#[derive(Debug, Clone)]
pub struct Program {
    pub source: Arc<str>,
    pub statements: Vec<Stmt>,
}

impl Program {
    /// Verbatim source of a span.
    pub fn source_of(&self, span: Span) -> &str {
        span.slice(&self.source)
    }
}

/// The opaque parse dependency: `parse(code) → AST`.
pub trait CodeParser: Send + Sync {
    fn parse(&self, code: &str) -> Result<Program>;
}

// ═══════════════════════════════════════════════════════════════
// SourceScanner - reference CodeParser implementation
// ═══════════════════════════════════════════════════════════════

/// Method names recognised as pure operations when called as `.name(...)`.
static METHOD_WHITELIST: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "filter",
        "map",
        "reduce",
        "flatMap",
        "find",
        "findIndex",
        "some",
        "every",
        "sort",
        "slice",
        "concat",
        "join",
        "split",
        "replace",
        "trim",
        "toLowerCase",
        "toUpperCase",
    ]
    .into_iter()
    .collect()
});

/// Namespaced prefix calls recognised as pure operations.
static NAMESPACE_WHITELIST: Lazy<Vec<(&'static str, Option<&'static [&'static str]>)>> =
    Lazy::new(|| {
        vec![
            ("Object", Some(&["keys", "values", "entries"][..])),
            ("JSON", Some(&["parse", "stringify"][..])),
            ("Math", None), // any Math.* call
        ]
    });

static MCP_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:await\s+)?mcp\.([A-Za-z_][\w-]*)\.([A-Za-z_]\w*)\s*\(").expect("valid regex")
});

static CAPABILITY_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:await\s+)?capabilities\.([A-Za-z_][\w:-]*)\s*\(").expect("valid regex")
});

static BINDING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*").expect("valid regex")
});

// Unanchored: fan-out also appears behind destructuring assignments
static PROMISE_ALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Promise\.all\s*\(\s*\[").expect("valid regex"));

/// Reference [`CodeParser`]: a span-preserving scanner for the documented
/// operation set. Deliberately does not try to be a JavaScript parser - code
/// outside the recognised set surfaces as opaque expressions.
#[derive(Debug, Clone, Default)]
pub struct SourceScanner;

impl SourceScanner {
    pub fn new() -> Self {
        Self
    }
}

impl CodeParser for SourceScanner {
    fn parse(&self, code: &str) -> Result<Program> {
        if code.trim().is_empty() {
            return Err(PmlError::ParseError {
                details: "empty code".to_string(),
            });
        }
        let blanked = blank_comments(code);
        let statements = split_statements(&blanked, 0, blanked.len())?;
        Ok(Program {
            source: Arc::from(code),
            statements,
        })
    }
}

/// Replace comment bytes with spaces so spans into the original survive.
fn blank_comments(code: &str) -> String {
    let bytes = code.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0;
    let mut in_str: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(quote) = in_str {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                in_str = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => {
                in_str = Some(b);
                i += 1;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out[i] = b' ';
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                while i < bytes.len() {
                    if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                        out[i] = b' ';
                        out[i + 1] = b' ';
                        i += 2;
                        break;
                    }
                    if bytes[i] != b'\n' {
                        out[i] = b' ';
                    }
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }

    String::from_utf8(out).unwrap_or_else(|_| code.to_string())
}

/// Find the byte offset just past the delimiter that closes the one at
/// `open`, honouring nested delimiters and string literals.
fn matching_close(src: &str, open: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let (open_ch, close_ch) = match bytes[open] {
        b'(' => (b'(', b')'),
        b'{' => (b'{', b'}'),
        b'[' => (b'[', b']'),
        _ => return None,
    };

    let mut depth = 0usize;
    let mut in_str: Option<u8> = None;
    let mut i = open;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(quote) = in_str {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                in_str = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => in_str = Some(b),
            _ if b == open_ch => depth += 1,
            _ if b == close_ch => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn skip_ws(src: &str, mut i: usize) -> usize {
    let bytes = src.as_bytes();
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Split `src[start..end]` into top-level statements.
fn split_statements(src: &str, start: usize, end: usize) -> Result<Vec<Stmt>> {
    let mut statements = Vec::new();
    let mut i = skip_ws(src, start);

    while i < end {
        if let Some(stmt) = scan_keyword_block(src, i, end)? {
            i = skip_ws(src, stmt.span.end);
            // trailing `;` after do-while or block
            if src.as_bytes().get(i) == Some(&b';') {
                i += 1;
            }
            statements.push(stmt);
            i = skip_ws(src, i);
            continue;
        }

        // Plain statement: runs to the next `;` at depth 0 (or to `end`)
        let stmt_end = statement_end(src, i, end);
        let text = src[i..stmt_end].trim_end();
        if !text.is_empty() {
            let span = Span::new(i, i + text.len());
            statements.push(scan_plain_statement(src, span)?);
        }
        i = skip_ws(src, (stmt_end + 1).min(end));
    }

    Ok(statements)
}

/// Offset of the `;` that terminates the statement starting at `i`, or `end`.
fn statement_end(src: &str, i: usize, end: usize) -> usize {
    let bytes = src.as_bytes();
    let mut depth = 0i32;
    let mut in_str: Option<u8> = None;
    let mut j = i;
    while j < end {
        let b = bytes[j];
        if let Some(quote) = in_str {
            if b == b'\\' {
                j += 2;
                continue;
            }
            if b == quote {
                in_str = None;
            }
            j += 1;
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => in_str = Some(b),
            b'(' | b'{' | b'[' => depth += 1,
            b')' | b'}' | b']' => depth -= 1,
            b';' if depth == 0 => return j,
            _ => {}
        }
        j += 1;
    }
    end
}

/// Scan `for`/`while`/`do`/`if` blocks starting at `i`; `None` when the
/// statement is not one of them.
fn scan_keyword_block(src: &str, i: usize, end: usize) -> Result<Option<Stmt>> {
    let rest = &src[i..end];

    let keyword = ["for", "while", "do", "if"]
        .into_iter()
        .find(|k| rest.starts_with(k) && !is_ident_char(rest.as_bytes().get(k.len()).copied()));
    let Some(keyword) = keyword else {
        return Ok(None);
    };

    let parse_err = |what: &str| PmlError::ParseError {
        details: format!("malformed {} statement near offset {}", what, i),
    };

    match keyword {
        "do" => {
            // do { body } while (cond)
            let brace = src[i..end].find('{').map(|p| i + p).ok_or_else(|| parse_err("do"))?;
            let body_end = matching_close(src, brace).ok_or_else(|| parse_err("do"))?;
            let after = skip_ws(src, body_end);
            if after >= end || !src[after..end].starts_with("while") {
                return Err(parse_err("do-while"));
            }
            let paren = src[after..end].find('(').map(|p| after + p).ok_or_else(|| parse_err("do-while"))?;
            let cond_end = matching_close(src, paren).ok_or_else(|| parse_err("do-while"))?;
            let condition = src[paren + 1..cond_end - 1].trim().to_string();
            let body = split_statements(src, brace + 1, body_end - 1)?;
            let span = Span::new(i, cond_end);
            Ok(Some(Stmt {
                span,
                kind: StmtKind::Loop(LoopStmt {
                    loop_type: LoopType::DoWhile,
                    condition,
                    body,
                    span,
                }),
            }))
        }
        "for" | "while" => {
            let paren = src[i..end].find('(').map(|p| i + p).ok_or_else(|| parse_err(keyword))?;
            let header_end = matching_close(src, paren).ok_or_else(|| parse_err(keyword))?;
            let header = src[paren + 1..header_end - 1].trim().to_string();
            let brace = skip_ws(src, header_end);
            if src.as_bytes().get(brace) != Some(&b'{') {
                return Err(PmlError::ParseError {
                    details: format!("{} body must be a block near offset {}", keyword, i),
                });
            }
            let body_end = matching_close(src, brace).ok_or_else(|| parse_err(keyword))?;
            let body = split_statements(src, brace + 1, body_end - 1)?;

            let loop_type = if keyword == "while" {
                LoopType::While
            } else if header.contains(" of ") {
                LoopType::ForOf
            } else if header.contains(" in ") {
                LoopType::ForIn
            } else {
                LoopType::For
            };

            let span = Span::new(i, body_end);
            Ok(Some(Stmt {
                span,
                kind: StmtKind::Loop(LoopStmt {
                    loop_type,
                    condition: header,
                    body,
                    span,
                }),
            }))
        }
        "if" => {
            let paren = src[i..end].find('(').map(|p| i + p).ok_or_else(|| parse_err("if"))?;
            let cond_end = matching_close(src, paren).ok_or_else(|| parse_err("if"))?;
            let condition = src[paren + 1..cond_end - 1].trim().to_string();
            let brace = skip_ws(src, cond_end);
            if src.as_bytes().get(brace) != Some(&b'{') {
                return Err(PmlError::ParseError {
                    details: format!("if body must be a block near offset {}", i),
                });
            }
            let then_end = matching_close(src, brace).ok_or_else(|| parse_err("if"))?;
            let then_branch = split_statements(src, brace + 1, then_end - 1)?;

            let mut span_end = then_end;
            let mut else_branch = Vec::new();
            let after = skip_ws(src, then_end);
            if after < end && src[after..end].starts_with("else") {
                let else_brace = skip_ws(src, after + 4);
                if src.as_bytes().get(else_brace) == Some(&b'{') {
                    let else_end = matching_close(src, else_brace).ok_or_else(|| parse_err("else"))?;
                    else_branch = split_statements(src, else_brace + 1, else_end - 1)?;
                    span_end = else_end;
                }
            }

            let span = Span::new(i, span_end);
            Ok(Some(Stmt {
                span,
                kind: StmtKind::If(IfStmt {
                    condition,
                    then_branch,
                    else_branch,
                    span,
                }),
            }))
        }
        _ => unreachable!(),
    }
}

fn is_ident_char(b: Option<u8>) -> bool {
    matches!(b, Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'$')
}

/// Scan a plain (non-block) statement: binding, return, or bare expression.
fn scan_plain_statement(src: &str, span: Span) -> Result<Stmt> {
    let text = span.slice(src);

    if let Some(rest) = text.strip_prefix("return") {
        if rest.is_empty() || !is_ident_char(rest.as_bytes().first().copied()) {
            let expr_src = rest.trim();
            let expr = if expr_src.is_empty() {
                None
            } else {
                let offset = span.start + (text.len() - rest.len()) + (rest.len() - rest.trim_start().len());
                Some(scan_expr(src, Span::new(offset, span.end)))
            };
            return Ok(Stmt {
                span,
                kind: StmtKind::Return { expr },
            });
        }
    }

    if let Some(caps) = BINDING.captures(text) {
        let name = caps.get(1).expect("binding capture").as_str().to_string();
        let expr_offset = span.start + caps.get(0).expect("binding match").end();
        let expr = scan_expr(src, Span::new(expr_offset, span.end));
        return Ok(Stmt {
            span,
            kind: StmtKind::Binding { name, expr },
        });
    }

    Ok(Stmt {
        span,
        kind: StmtKind::Bare {
            expr: scan_expr(src, span),
        },
    })
}

/// Scan one expression: classify the head, then collect the pure-op chain.
fn scan_expr(src: &str, span: Span) -> Expr {
    let text = span.slice(src);

    // Promise.all fan-out: branches are the top-level comma-separated
    // elements of the array literal
    if let Some(m) = PROMISE_ALL.find(text) {
        let bracket = span.start + m.end() - 1;
        if let Some(close) = matching_close(src, bracket) {
            let branches = split_top_level_commas(src, bracket + 1, close - 1)
                .into_iter()
                .map(|s| scan_expr(src, s))
                .collect();
            return Expr {
                head: Head::FanOut(branches),
                ops: Vec::new(),
                span,
            };
        }
    }

    if let Some(caps) = MCP_CALL.captures(text) {
        let server = caps.get(1).expect("server capture").as_str().to_string();
        let tool = caps.get(2).expect("tool capture").as_str().to_string();
        let paren = span.start + caps.get(0).expect("mcp match").end() - 1;
        if let Some(close) = matching_close(src, paren) {
            let args = src[paren + 1..close - 1].trim().to_string();
            let head_span = Span::new(span.start, close);
            let ops = scan_pure_ops(src, Span::new(close, span.end), span.start);
            return Expr {
                head: Head::Mcp {
                    server,
                    tool,
                    args,
                    span: head_span,
                },
                ops,
                span,
            };
        }
    }

    if let Some(caps) = CAPABILITY_CALL.captures(text) {
        let name = caps.get(1).expect("capability capture").as_str().to_string();
        let paren = span.start + caps.get(0).expect("capability match").end() - 1;
        if let Some(close) = matching_close(src, paren) {
            let args = src[paren + 1..close - 1].trim().to_string();
            let head_span = Span::new(span.start, close);
            let ops = scan_pure_ops(src, Span::new(close, span.end), span.start);
            return Expr {
                head: Head::Capability {
                    name,
                    args,
                    span: head_span,
                },
                ops,
                span,
            };
        }
    }

    let ops = scan_pure_ops(src, span, span.start);
    Expr {
        head: Head::Value,
        ops,
        span,
    }
}

/// Split `src[start..end]` on commas at delimiter depth 0.
fn split_top_level_commas(src: &str, start: usize, end: usize) -> Vec<Span> {
    let bytes = src.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0i32;
    let mut in_str: Option<u8> = None;
    let mut piece_start = skip_ws(src, start);
    let mut i = piece_start;

    while i < end {
        let b = bytes[i];
        if let Some(quote) = in_str {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                in_str = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => in_str = Some(b),
            b'(' | b'{' | b'[' => depth += 1,
            b')' | b'}' | b']' => depth -= 1,
            b',' if depth == 0 => {
                let piece = src[piece_start..i].trim_end();
                if !piece.is_empty() {
                    spans.push(Span::new(piece_start, piece_start + piece.len()));
                }
                piece_start = skip_ws(src, i + 1);
            }
            _ => {}
        }
        i += 1;
    }

    let piece = src[piece_start..end.min(src.len())].trim_end();
    if !piece.is_empty() {
        spans.push(Span::new(piece_start, piece_start + piece.len()));
    }
    spans
}

/// Collect whitelisted pure calls in `src[scan.start..scan.end]`.
///
/// `chain_start` anchors each op's span: spans run from the chain start
/// through the op's closing paren, so the last op's span is the whole
/// sub-expression (the unit the sandbox executes).
fn scan_pure_ops(src: &str, scan: Span, chain_start: usize) -> Vec<PureOp> {
    let bytes = src.as_bytes();
    let mut ops = Vec::new();
    let mut depth = 0u8;
    let mut close_stack: Vec<usize> = Vec::new();
    let mut in_str: Option<u8> = None;
    let mut i = scan.start;

    while i < scan.end {
        while let Some(&close) = close_stack.last() {
            if i >= close {
                close_stack.pop();
                depth = depth.saturating_sub(1);
            } else {
                break;
            }
        }

        let b = bytes[i];
        if let Some(quote) = in_str {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                in_str = None;
            }
            i += 1;
            continue;
        }
        if matches!(b, b'"' | b'\'' | b'`') {
            in_str = Some(b);
            i += 1;
            continue;
        }

        if let Some((op, paren)) = match_pure_call(src, i, scan.end) {
            if let Some(close) = matching_close(src, paren) {
                ops.push(PureOp {
                    op,
                    span: Span::new(chain_start, close),
                    nesting: depth,
                });
                // Descend into the call's arguments to find nested ops
                close_stack.push(close);
                depth += 1;
                i = paren + 1;
                continue;
            }
        }

        // Track non-call parens so args of unknown calls still nest
        if matches!(b, b'(' | b'[' | b'{') {
            if let Some(close) = matching_close(src, i) {
                close_stack.push(close);
                depth += 1;
                i += 1;
                continue;
            }
        }

        i += 1;
    }

    ops
}

/// Does a whitelisted call start at `i`? Returns (op name, offset of `(`).
fn match_pure_call(src: &str, i: usize, end: usize) -> Option<(String, usize)> {
    let bytes = src.as_bytes();

    // Method call: .name(
    if bytes[i] == b'.' {
        let mut j = i + 1;
        while j < end && is_ident_char(Some(bytes[j])) {
            j += 1;
        }
        let name = &src[i + 1..j];
        let k = skip_ws(src, j);
        if k < end && bytes[k] == b'(' && METHOD_WHITELIST.contains(name) {
            return Some((name.to_string(), k));
        }
        return None;
    }

    // Namespace call: Object.keys( / JSON.parse( / Math.xxx(
    // Only at a token boundary
    if i > 0 && is_ident_char(Some(bytes[i - 1])) {
        return None;
    }
    for (ns, members) in NAMESPACE_WHITELIST.iter() {
        if src[i..end].starts_with(ns) && bytes.get(i + ns.len()) == Some(&b'.') {
            let mut j = i + ns.len() + 1;
            let name_start = j;
            while j < end && is_ident_char(Some(bytes[j])) {
                j += 1;
            }
            let name = &src[name_start..j];
            if name.is_empty() {
                return None;
            }
            if let Some(members) = members {
                if !members.contains(&name) {
                    return None;
                }
            }
            let k = skip_ws(src, j);
            if k < end && bytes[k] == b'(' {
                return Some((name.to_string(), k));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(code: &str) -> Program {
        SourceScanner::new().parse(code).unwrap()
    }

    #[test]
    fn empty_code_is_parse_error() {
        let err = SourceScanner::new().parse("   ").unwrap_err();
        assert_eq!(err.code(), "PML-010");
    }

    #[test]
    fn pure_pipeline_statements() {
        let program = parse(
            "const n=[1,2,3]; const d = n.map(x=>x*2); return d.reduce((a,b)=>a+b,0);",
        );
        assert_eq!(program.statements.len(), 3);

        // Literal binding: opaque expression
        match &program.statements[0].kind {
            StmtKind::Binding { name, expr } => {
                assert_eq!(name, "n");
                assert!(expr.is_opaque());
            }
            other => panic!("expected binding, got {:?}", other),
        }

        // map chain
        match &program.statements[1].kind {
            StmtKind::Binding { name, expr } => {
                assert_eq!(name, "d");
                assert_eq!(expr.ops.len(), 1);
                assert_eq!(expr.ops[0].op, "map");
                assert_eq!(expr.ops[0].nesting, 0);
                assert_eq!(program.source_of(expr.ops[0].span), "n.map(x=>x*2)");
            }
            other => panic!("expected binding, got {:?}", other),
        }

        // return with reduce
        match &program.statements[2].kind {
            StmtKind::Return { expr: Some(expr) } => {
                assert_eq!(expr.ops.len(), 1);
                assert_eq!(expr.ops[0].op, "reduce");
                assert_eq!(
                    program.source_of(expr.ops[0].span),
                    "d.reduce((a,b)=>a+b,0)"
                );
            }
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn chained_ops_share_chain_start() {
        let program = parse("const out = rows.filter(r => r.ok).map(r => r.name);");
        let StmtKind::Binding { expr, .. } = &program.statements[0].kind else {
            panic!("expected binding");
        };
        assert_eq!(expr.ops.len(), 2);
        assert_eq!(expr.ops[0].op, "filter");
        assert_eq!(expr.ops[1].op, "map");
        assert_eq!(
            program.source_of(expr.ops[0].span),
            "rows.filter(r => r.ok)"
        );
        assert_eq!(
            program.source_of(expr.ops[1].span),
            "rows.filter(r => r.ok).map(r => r.name)"
        );
    }

    #[test]
    fn mcp_call_head_with_chain() {
        let program = parse(
            r#"const rows = await mcp.db.query({ sql: "select 1" }); const names = rows.map(r => r.name);"#,
        );
        let StmtKind::Binding { name, expr } = &program.statements[0].kind else {
            panic!("expected binding");
        };
        assert_eq!(name, "rows");
        match &expr.head {
            Head::Mcp { server, tool, args, .. } => {
                assert_eq!(server, "db");
                assert_eq!(tool, "query");
                assert!(args.contains("select 1"));
            }
            other => panic!("expected mcp head, got {:?}", other),
        }
        assert!(expr.ops.is_empty());
    }

    #[test]
    fn capability_call_head() {
        let program = parse(r#"const ctx = await capabilities.summarize({ text: t });"#);
        let StmtKind::Binding { expr, .. } = &program.statements[0].kind else {
            panic!("expected binding");
        };
        assert!(matches!(&expr.head, Head::Capability { name, .. } if name == "summarize"));
    }

    #[test]
    fn nested_op_has_nonzero_nesting() {
        let program = parse("const parsed = items.map(x => JSON.parse(x));");
        let StmtKind::Binding { expr, .. } = &program.statements[0].kind else {
            panic!("expected binding");
        };
        assert_eq!(expr.ops.len(), 2);
        assert_eq!(expr.ops[0].op, "map");
        assert_eq!(expr.ops[0].nesting, 0);
        assert_eq!(expr.ops[1].op, "parse");
        assert_eq!(expr.ops[1].nesting, 1);
    }

    #[test]
    fn for_of_loop_with_mcp_body() {
        let program = parse(
            "for (const r of rows) { await mcp.email.send({ to: r.addr }); }",
        );
        assert_eq!(program.statements.len(), 1);
        let StmtKind::Loop(loop_stmt) = &program.statements[0].kind else {
            panic!("expected loop");
        };
        assert_eq!(loop_stmt.loop_type, LoopType::ForOf);
        assert_eq!(loop_stmt.condition, "const r of rows");
        assert_eq!(loop_stmt.body.len(), 1);
        let StmtKind::Bare { expr } = &loop_stmt.body[0].kind else {
            panic!("expected bare statement in body");
        };
        assert!(matches!(&expr.head, Head::Mcp { server, tool, .. } if server == "email" && tool == "send"));
        // Whole loop source is span-extractable for native execution
        assert!(program
            .source_of(loop_stmt.span)
            .starts_with("for (const r of rows)"));
    }

    #[test]
    fn loop_types_detected() {
        let cases = [
            ("for (let i = 0; i < 3; i++) { work(); }", LoopType::For),
            ("for (const k in obj) { work(); }", LoopType::ForIn),
            ("while (more) { work(); }", LoopType::While),
            ("do { work(); } while (more);", LoopType::DoWhile),
        ];
        for (code, expected) in cases {
            let program = parse(code);
            let StmtKind::Loop(loop_stmt) = &program.statements[0].kind else {
                panic!("expected loop for {}", code);
            };
            assert_eq!(loop_stmt.loop_type, expected, "for {}", code);
        }
    }

    #[test]
    fn if_else_branches() {
        let program = parse(
            "if (rows.length > 0) { const a = rows.map(r => r.id); } else { const b = 0; }",
        );
        let StmtKind::If(if_stmt) = &program.statements[0].kind else {
            panic!("expected if");
        };
        assert_eq!(if_stmt.condition, "rows.length > 0");
        assert_eq!(if_stmt.then_branch.len(), 1);
        assert_eq!(if_stmt.else_branch.len(), 1);
    }

    #[test]
    fn promise_all_fan_out() {
        let program = parse(
            "const [a, b] = await Promise.all([mcp.db.query({}), mcp.web.get({})]);",
        );
        // Destructuring is not a recognised binding; still a statement with fan-out
        let expr = match &program.statements[0].kind {
            StmtKind::Binding { expr, .. } | StmtKind::Bare { expr } => expr,
            other => panic!("unexpected statement {:?}", other),
        };
        let Head::FanOut(branches) = &expr.head else {
            panic!("expected fan-out head, got {:?}", expr.head);
        };
        assert_eq!(branches.len(), 2);
        assert!(matches!(&branches[0].head, Head::Mcp { server, .. } if server == "db"));
        assert!(matches!(&branches[1].head, Head::Mcp { server, .. } if server == "web"));
    }

    #[test]
    fn comments_are_ignored_but_spans_survive() {
        let code = "// leading comment\nconst d = n.map(x => x); /* block */ return d;";
        let program = parse(code);
        assert_eq!(program.statements.len(), 2);
        let StmtKind::Binding { expr, .. } = &program.statements[0].kind else {
            panic!("expected binding");
        };
        assert_eq!(program.source_of(expr.ops[0].span), "n.map(x => x)");
    }

    #[test]
    fn math_namespace_is_whitelisted() {
        let program = parse("const m = Math.max(a, b);");
        let StmtKind::Binding { expr, .. } = &program.statements[0].kind else {
            panic!("expected binding");
        };
        assert_eq!(expr.ops.len(), 1);
        assert_eq!(expr.ops[0].op, "max");
    }

    #[test]
    fn unknown_namespace_member_is_opaque() {
        let program = parse("const m = Object.freeze(a);");
        let StmtKind::Binding { expr, .. } = &program.statements[0].kind else {
            panic!("expected binding");
        };
        assert!(expr.is_opaque());
    }

    #[test]
    fn strings_do_not_confuse_statement_split() {
        let program = parse(r#"const s = x.replace("a;b", ";"); return s;"#);
        assert_eq!(program.statements.len(), 2);
        let StmtKind::Binding { expr, .. } = &program.statements[0].kind else {
            panic!("expected binding");
        };
        assert_eq!(expr.ops[0].op, "replace");
    }
}
