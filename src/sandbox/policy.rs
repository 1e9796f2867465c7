use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::lexer::{tokenize, TokenKind};
use super::parser::{Expr, Parser, Program, Stmt, StmtKind};

/// Free functions a program may call.
pub const ALLOWED_FUNCTIONS: &[&str] = &[
    "print",
    "len",
    "str",
    "int",
    "lines",
    "split",
    "join",
    "chunk",
    "chunk_lines",
    "split_regex",
    "grep",
    "search",
    "find",
    "count",
    "contains",
    "startswith",
    "endswith",
    "replace",
    "upper",
    "lower",
    "strip",
    "slice",
    "range",
    "min",
    "max",
    "show_vars",
    "final",
    "recurse",
];

/// Methods a program may call on a value.
pub const ALLOWED_METHODS: &[&str] = &[
    "split",
    "lines",
    "find",
    "count",
    "contains",
    "startswith",
    "endswith",
    "replace",
    "upper",
    "lower",
    "strip",
    "join",
];

/// Name bound to the corpus view.
pub const CONTEXT_BINDING: &str = "context";

/// Identifiers rejected wherever they appear, with the capability they reach for.
const DENYLIST: &[(&str, RejectionCategory)] = &[
    ("open", RejectionCategory::Filesystem),
    ("file", RejectionCategory::Filesystem),
    ("pathlib", RejectionCategory::Filesystem),
    ("shutil", RejectionCategory::Filesystem),
    ("tempfile", RejectionCategory::Filesystem),
    ("os", RejectionCategory::Process),
    ("sys", RejectionCategory::Process),
    ("subprocess", RejectionCategory::Process),
    ("popen", RejectionCategory::Process),
    ("system", RejectionCategory::Process),
    ("spawn", RejectionCategory::Process),
    ("fork", RejectionCategory::Process),
    ("signal", RejectionCategory::Process),
    ("multiprocessing", RejectionCategory::Process),
    ("threading", RejectionCategory::Process),
    ("exit", RejectionCategory::Process),
    ("quit", RejectionCategory::Process),
    ("socket", RejectionCategory::Network),
    ("requests", RejectionCategory::Network),
    ("urllib", RejectionCategory::Network),
    ("urllib3", RejectionCategory::Network),
    ("http", RejectionCategory::Network),
    ("httpx", RejectionCategory::Network),
    ("ftplib", RejectionCategory::Network),
    ("smtplib", RejectionCategory::Network),
    ("import", RejectionCategory::ModuleLoading),
    ("importlib", RejectionCategory::ModuleLoading),
    ("require", RejectionCategory::ModuleLoading),
    ("load_module", RejectionCategory::ModuleLoading),
    ("eval", RejectionCategory::Reflection),
    ("exec", RejectionCategory::Reflection),
    ("compile", RejectionCategory::Reflection),
    ("getattr", RejectionCategory::Reflection),
    ("setattr", RejectionCategory::Reflection),
    ("delattr", RejectionCategory::Reflection),
    ("hasattr", RejectionCategory::Reflection),
    ("globals", RejectionCategory::Reflection),
    ("locals", RejectionCategory::Reflection),
    ("vars", RejectionCategory::Reflection),
    ("builtins", RejectionCategory::Reflection),
    ("dir", RejectionCategory::Reflection),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    Empty,
    Syntax,
    Filesystem,
    Process,
    Network,
    ModuleLoading,
    Reflection,
    BindingEscape,
    Unrecognized,
}

impl std::fmt::Display for RejectionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectionCategory::Empty => "empty program",
            RejectionCategory::Syntax => "syntax",
            RejectionCategory::Filesystem => "filesystem access",
            RejectionCategory::Process => "process access",
            RejectionCategory::Network => "network access",
            RejectionCategory::ModuleLoading => "module loading",
            RejectionCategory::Reflection => "runtime reflection",
            RejectionCategory::BindingEscape => "binding escape",
            RejectionCategory::Unrecognized => "unrecognized operation",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub category: RejectionCategory,
    pub detail: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.category)
        } else {
            write!(f, "{}: {}", self.category, self.detail)
        }
    }
}

/// A program that passed the policy. Only [`SafetyPolicy::check`] builds one,
/// and the executor accepts nothing else.
#[derive(Debug, Clone)]
pub struct ApprovedProgram {
    source: String,
    program: Arc<Program>,
}

impl ApprovedProgram {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn program(&self) -> Arc<Program> {
        Arc::clone(&self.program)
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Approved(ApprovedProgram),
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Verdict::Rejected(r) => Some(r),
            Verdict::Approved(_) => None,
        }
    }
}

/// Static classifier for submitted programs. Pure: the same text always
/// yields the same verdict, and nothing is executed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyPolicy;

impl SafetyPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, source: &str) -> Verdict {
        match self.classify(source) {
            Ok(program) => Verdict::Approved(ApprovedProgram {
                source: source.to_string(),
                program: Arc::new(program),
            }),
            Err(rejection) => Verdict::Rejected(rejection),
        }
    }

    fn classify(&self, source: &str) -> Result<Program, Rejection> {
        if source.trim().is_empty() {
            return Err(reject(RejectionCategory::Empty, ""));
        }

        let tokens = tokenize(source)
            .map_err(|e| reject(RejectionCategory::Syntax, e.to_string()))?;

        for token in &tokens {
            if let TokenKind::Ident(name) = &token.kind {
                if let Some(category) = denied_identifier(name) {
                    return Err(reject(
                        category,
                        format!("'{name}' is not available in the sandbox (line {})", token.line),
                    ));
                }
            }
        }

        let program = Parser::new(tokens)
            .parse_program()
            .map_err(|e| reject(RejectionCategory::Syntax, e.to_string()))?;

        if program.stmts.is_empty() {
            return Err(reject(RejectionCategory::Empty, "no statements"));
        }

        check_stmts(&program.stmts)?;
        Ok(program)
    }
}

fn reject(category: RejectionCategory, detail: impl Into<String>) -> Rejection {
    Rejection {
        category,
        detail: detail.into(),
    }
}

fn denied_identifier(name: &str) -> Option<RejectionCategory> {
    if name.starts_with("__") {
        return Some(if name.contains("import") {
            RejectionCategory::ModuleLoading
        } else {
            RejectionCategory::Reflection
        });
    }
    DENYLIST
        .iter()
        .find(|(denied, _)| *denied == name)
        .map(|(_, category)| *category)
}

/// Best-effort category for a call the whitelist does not know.
fn categorize_unknown(name: &str) -> RejectionCategory {
    let lower = name.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(&["file", "path", "dir", "read", "write", "mkdir", "remove", "unlink"]) {
        RejectionCategory::Filesystem
    } else if has(&["exec", "spawn", "proc", "shell", "system", "cmd", "kill"]) {
        RejectionCategory::Process
    } else if has(&["http", "url", "socket", "net", "request", "fetch", "download", "connect"]) {
        RejectionCategory::Network
    } else if has(&["import", "module", "load", "require"]) {
        RejectionCategory::ModuleLoading
    } else if has(&["attr", "eval", "global", "local", "builtin", "compile", "class", "type"]) {
        RejectionCategory::Reflection
    } else {
        RejectionCategory::Unrecognized
    }
}

fn is_reserved(name: &str) -> bool {
    name == CONTEXT_BINDING || ALLOWED_FUNCTIONS.contains(&name)
}

fn check_binding(name: &str, line: usize) -> Result<(), Rejection> {
    if is_reserved(name) {
        return Err(reject(
            RejectionCategory::BindingEscape,
            format!("cannot rebind '{name}' (line {line})"),
        ));
    }
    Ok(())
}

fn check_stmts(stmts: &[Stmt]) -> Result<(), Rejection> {
    for stmt in stmts {
        check_stmt(stmt)?;
    }
    Ok(())
}

fn check_stmt(stmt: &Stmt) -> Result<(), Rejection> {
    let line = stmt.line;
    match &stmt.kind {
        StmtKind::Let { name, value } | StmtKind::Assign { name, value } => {
            check_binding(name, line)?;
            check_expr(value, line)
        }
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            check_expr(cond, line)?;
            check_stmts(then_branch)?;
            check_stmts(else_branch)
        }
        StmtKind::For { var, iter, body } => {
            check_binding(var, line)?;
            check_expr(iter, line)?;
            check_stmts(body)
        }
        StmtKind::Expr(expr) => check_expr(expr, line),
    }
}

fn check_exprs(exprs: &[Expr], line: usize) -> Result<(), Rejection> {
    for expr in exprs {
        check_expr(expr, line)?;
    }
    Ok(())
}

fn check_expr(expr: &Expr, line: usize) -> Result<(), Rejection> {
    match expr {
        Expr::Int(_) | Expr::Str(_) | Expr::Bool(_) | Expr::None => Ok(()),
        Expr::Name(name) => {
            if ALLOWED_FUNCTIONS.contains(&name.as_str()) {
                return Err(reject(
                    RejectionCategory::BindingEscape,
                    format!("'{name}' is a function and cannot be used as a value (line {line})"),
                ));
            }
            Ok(())
        }
        Expr::List(items) => check_exprs(items, line),
        Expr::Unary { expr, .. } => check_expr(expr, line),
        Expr::Binary { lhs, rhs, .. } => {
            check_expr(lhs, line)?;
            check_expr(rhs, line)
        }
        Expr::Call { name, args } => {
            if !ALLOWED_FUNCTIONS.contains(&name.as_str()) {
                return Err(reject(
                    categorize_unknown(name),
                    format!("call to unknown function '{name}' (line {line})"),
                ));
            }
            check_exprs(args, line)
        }
        Expr::Method {
            receiver,
            name,
            args,
        } => {
            if !ALLOWED_METHODS.contains(&name.as_str()) {
                return Err(reject(
                    categorize_unknown(name),
                    format!("call to unknown method '.{name}()' (line {line})"),
                ));
            }
            check_expr(receiver, line)?;
            check_exprs(args, line)
        }
        Expr::Attr { name, .. } => Err(reject(
            RejectionCategory::Reflection,
            format!("attribute access '.{name}' is not permitted (line {line})"),
        )),
        Expr::Index { target, index } => {
            check_expr(target, line)?;
            check_expr(index, line)
        }
        Expr::Slice { target, start, end } => {
            check_expr(target, line)?;
            if let Some(start) = start {
                check_expr(start, line)?;
            }
            if let Some(end) = end {
                check_expr(end, line)?;
            }
            Ok(())
        }
    }
}
