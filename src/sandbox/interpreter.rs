use std::collections::BTreeMap;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::error::FaultClass;

use super::parser::{BinaryOp, Expr, Program, Stmt, StmtKind, UnaryOp};
use super::policy::CONTEXT_BINDING;

/// Largest text (in characters) or list (in elements) a single operation may build.
pub const MAX_VALUE_LEN: usize = 10_000_000;
/// Total characters/elements a program may allocate across one run.
pub const MAX_ALLOCATION: usize = 200_000_000;
/// Largest list `range()` will produce.
pub const MAX_RANGE: i64 = 1_000_000;
/// Deepest list-in-list a program may build. Only list literals add a
/// level; concatenation, repetition and slicing keep their operands' depth.
pub const MAX_LIST_NESTING: usize = 64;

const REGEX_SIZE_LIMIT: usize = 1 << 20;

// ─── Values ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Text(Arc<str>),
    List(Arc<Vec<Value>>),
}

impl Value {
    pub fn text(s: impl Into<Arc<str>>) -> Self {
        Value::Text(s.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    /// Levels of list nesting; 0 for scalars and text.
    pub fn nesting(&self) -> usize {
        match self {
            Value::List(items) => 1 + items.iter().map(Value::nesting).max().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Text(_) => "text",
            Value::List(_) => "list",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Text(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
        }
    }

    /// Quoted rendering, used inside lists.
    pub fn repr(&self) -> String {
        match self {
            Value::Text(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        '\r' => out.push_str("\\r"),
                        '\\' => out.push_str("\\\\"),
                        '\'' => out.push_str("\\'"),
                        other => out.push(other),
                    }
                }
                out.push('\'');
                out
            }
            other => other.to_string(),
        }
    }

    /// Size used for allocation accounting.
    fn weight(&self) -> usize {
        match self {
            Value::Text(s) => s.len(),
            Value::List(items) => items.len(),
            _ => 1,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "]")
            }
        }
    }
}

// ─── Scratch arena ─────────────────────────────────────────────────────────

/// Variables a session's programs have bound. Owned by one session and
/// carried from iteration to iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scratch {
    vars: BTreeMap<String, Value>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.vars.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

// ─── Faults ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NameError,
    TypeError,
    ValueError,
    IndexError,
    ZeroDivisionError,
    OverflowError,
    RecursionDepthExceeded,
    RecursionError,
    LimitError,
    /// The host asked the program to stop.
    Interrupted,
}

impl FaultKind {
    pub fn class(self) -> FaultClass {
        match self {
            FaultKind::RecursionDepthExceeded => FaultClass::RecursionDepthExceeded,
            _ => FaultClass::SandboxRuntimeFault,
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A runtime fault raised by a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    /// 1-based line; 0 until the interpreter attaches one.
    pub line: usize,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: 0,
        }
    }

    fn at(mut self, line: usize) -> Self {
        if self.line == 0 {
            self.line = line;
        }
        self
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (line {})", self.kind, self.message, self.line)
    }
}

/// Host services a running program can reach.
pub trait RuntimeHooks {
    /// Answer `question` over `text` in a child session.
    fn recurse(&self, question: &str, text: &str) -> Result<String, Fault>;

    /// Polled between steps; `true` stops the program.
    fn should_stop(&self) -> bool;
}

// ─── Output capture ────────────────────────────────────────────────────────

/// Printed output, stored up to `cap` characters while counting everything.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    text: String,
    stored: usize,
    total: usize,
    cap: usize,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Self::default()
        }
    }

    pub fn push(&mut self, s: &str) {
        let n = s.chars().count();
        self.total = self.total.saturating_add(n);
        if self.stored >= self.cap {
            return;
        }
        let room = self.cap - self.stored;
        if n <= room {
            self.text.push_str(s);
            self.stored += n;
        } else {
            self.text.extend(s.chars().take(room));
            self.stored = self.cap;
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.cap
    }

    pub fn total_chars(&self) -> usize {
        self.total
    }

    /// Captured text, with a truncation marker when output exceeded the cap.
    pub fn render(&self) -> String {
        if self.is_truncated() {
            format!(
                "{}\n... (output truncated to {}/{} characters)",
                self.text.trim_end_matches('\n'),
                self.cap,
                self.total
            )
        } else {
            self.text.clone()
        }
    }
}

// ─── Interpreter ───────────────────────────────────────────────────────────

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Ran to the end.
    Finished,
    /// `final(value)` was called.
    Final(String),
    Faulted(Fault),
}

/// Everything a run produced. The scratch reflects every binding made
/// before the program stopped.
#[derive(Debug)]
pub struct Execution {
    pub scratch: Scratch,
    pub output: OutputBuffer,
    pub completion: Completion,
}

enum Halt {
    Final(String),
    Fault(Fault),
}

impl From<Fault> for Halt {
    fn from(fault: Fault) -> Self {
        Halt::Fault(fault)
    }
}

type Eval<T> = Result<T, Halt>;

/// Tree-walking evaluator for approved programs.
pub struct Interpreter<'h> {
    scratch: Scratch,
    context: Arc<str>,
    output: OutputBuffer,
    hooks: &'h dyn RuntimeHooks,
    line: usize,
    allocated: usize,
}

impl<'h> Interpreter<'h> {
    pub fn new(
        scratch: Scratch,
        context: Arc<str>,
        output_cap: usize,
        hooks: &'h dyn RuntimeHooks,
    ) -> Self {
        Self {
            scratch,
            context,
            output: OutputBuffer::new(output_cap),
            hooks,
            line: 0,
            allocated: 0,
        }
    }

    pub fn run(mut self, program: &Program) -> Execution {
        let completion = match self.run_top_level(&program.stmts) {
            Ok(()) => Completion::Finished,
            Err(Halt::Final(answer)) => Completion::Final(answer),
            Err(Halt::Fault(fault)) => Completion::Faulted(fault.at(self.line.max(1))),
        };
        Execution {
            scratch: self.scratch,
            output: self.output,
            completion,
        }
    }

    fn run_top_level(&mut self, stmts: &[Stmt]) -> Eval<()> {
        let Some((last, init)) = stmts.split_last() else {
            return Ok(());
        };
        self.exec_block(init)?;
        if let StmtKind::Expr(expr) = &last.kind {
            self.enter(last.line)?;
            let value = self.eval(expr)?;
            if value != Value::None {
                self.output.push(&value.to_string());
                self.output.push("\n");
            }
            Ok(())
        } else {
            self.exec(last)
        }
    }

    fn enter(&mut self, line: usize) -> Eval<()> {
        self.line = line;
        if self.hooks.should_stop() {
            return Err(self.fault(FaultKind::Interrupted, "execution stopped").into());
        }
        Ok(())
    }

    fn fault(&self, kind: FaultKind, message: impl Into<String>) -> Fault {
        Fault::new(kind, message).at(self.line.max(1))
    }

    fn charge(&mut self, value: &Value) -> Eval<()> {
        self.charge_weight(value.weight())
    }

    fn charge_weight(&mut self, weight: usize) -> Eval<()> {
        if weight > MAX_VALUE_LEN {
            return Err(self
                .fault(
                    FaultKind::LimitError,
                    format!("value of {weight} items exceeds the limit of {MAX_VALUE_LEN}"),
                )
                .into());
        }
        self.allocated = self.allocated.saturating_add(weight);
        if self.allocated > MAX_ALLOCATION {
            return Err(self
                .fault(
                    FaultKind::LimitError,
                    format!("program allocated more than {MAX_ALLOCATION} items"),
                )
                .into());
        }
        Ok(())
    }

    fn charged(&mut self, value: Value) -> Eval<Value> {
        self.charge(&value)?;
        Ok(value)
    }

    // ─── Statements ────────────────────────────────────────────────────────

    fn exec_block(&mut self, stmts: &[Stmt]) -> Eval<()> {
        for stmt in stmts {
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt) -> Eval<()> {
        self.enter(stmt.line)?;
        match &stmt.kind {
            StmtKind::Let { name, value } | StmtKind::Assign { name, value } => {
                let value = self.eval(value)?;
                self.scratch.set(name.clone(), value);
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if self.eval(cond)?.truthy() {
                    self.exec_block(then_branch)?;
                } else {
                    self.exec_block(else_branch)?;
                }
            }
            StmtKind::For { var, iter, body } => {
                let items = match self.eval(iter)? {
                    Value::List(items) => items,
                    Value::Text(s) => {
                        self.charge_weight(s.chars().count())?;
                        Arc::new(s.chars().map(|c| Value::text(c.to_string())).collect())
                    }
                    other => {
                        return Err(self
                            .fault(
                                FaultKind::TypeError,
                                format!("cannot iterate over {}", other.type_name()),
                            )
                            .into());
                    }
                };
                for item in items.iter() {
                    self.enter(stmt.line)?;
                    self.scratch.set(var.clone(), item.clone());
                    self.exec_block(body)?;
                }
            }
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(())
    }

    // ─── Expressions ───────────────────────────────────────────────────────

    fn eval(&mut self, expr: &Expr) -> Eval<Value> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::text(s.as_str())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                let list = Value::list(values);
                let depth = list.nesting();
                if depth > MAX_LIST_NESTING {
                    return Err(self
                        .fault(
                            FaultKind::LimitError,
                            format!("list nested {depth} levels deep exceeds the limit of {MAX_LIST_NESTING}"),
                        )
                        .into());
                }
                self.charged(list)
            }
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(|| {
                            self.fault(FaultKind::OverflowError, "integer overflow").into()
                        }),
                        other => Err(self
                            .fault(
                                FaultKind::TypeError,
                                format!("cannot negate {}", other.type_name()),
                            )
                            .into()),
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::And => {
                    let left = self.eval(lhs)?;
                    if left.truthy() {
                        self.eval(rhs)
                    } else {
                        Ok(left)
                    }
                }
                BinaryOp::Or => {
                    let left = self.eval(lhs)?;
                    if left.truthy() {
                        Ok(left)
                    } else {
                        self.eval(rhs)
                    }
                }
                _ => {
                    let left = self.eval(lhs)?;
                    let right = self.eval(rhs)?;
                    self.binary(*op, left, right)
                }
            },
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.call(name, values)
            }
            Expr::Method {
                receiver,
                name,
                args,
            } => {
                let receiver = self.eval(receiver)?;
                let mut values = Vec::with_capacity(args.len() + 1);
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                if name == "join" {
                    // `sep.join(items)`
                    let items = values.into_iter().next().unwrap_or(Value::None);
                    self.call("join", vec![items, receiver])
                } else {
                    values.insert(0, receiver);
                    self.call(name, values)
                }
            }
            Expr::Attr { name, .. } => Err(self
                .fault(
                    FaultKind::NameError,
                    format!("attribute access '.{name}' is not available"),
                )
                .into()),
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                self.index(target, index)
            }
            Expr::Slice { target, start, end } => {
                let target = self.eval(target)?;
                let start = match start {
                    Some(e) => Some(self.eval(e)?),
                    None => None,
                };
                let end = match end {
                    Some(e) => Some(self.eval(e)?),
                    None => None,
                };
                self.slice(target, start, end)
            }
        }
    }

    fn lookup(&self, name: &str) -> Eval<Value> {
        if name == CONTEXT_BINDING {
            return Ok(Value::Text(Arc::clone(&self.context)));
        }
        self.scratch
            .get(name)
            .cloned()
            .ok_or_else(|| self.fault(FaultKind::NameError, format!("undefined name '{name}'")).into())
    }

    fn binary(&mut self, op: BinaryOp, left: Value, right: Value) -> Eval<Value> {
        use Value::*;
        let overflow = |this: &Self| -> Halt {
            this.fault(FaultKind::OverflowError, "integer overflow").into()
        };
        match (op, left, right) {
            (BinaryOp::Add, Int(a), Int(b)) => a.checked_add(b).map(Int).ok_or_else(|| overflow(self)),
            (BinaryOp::Add, Text(a), Text(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(&a);
                s.push_str(&b);
                self.charged(Value::text(s))
            }
            (BinaryOp::Add, List(a), List(b)) => {
                let mut items = Arc::unwrap_or_clone(a);
                items.extend(b.iter().cloned());
                self.charged(Value::list(items))
            }
            (BinaryOp::Sub, Int(a), Int(b)) => a.checked_sub(b).map(Int).ok_or_else(|| overflow(self)),
            (BinaryOp::Mul, Int(a), Int(b)) => a.checked_mul(b).map(Int).ok_or_else(|| overflow(self)),
            (BinaryOp::Mul, Text(s), Int(n)) | (BinaryOp::Mul, Int(n), Text(s)) => {
                let times = n.max(0) as usize;
                self.check_repeat(s.chars().count(), times)?;
                self.charged(Value::text(s.repeat(times)))
            }
            (BinaryOp::Mul, List(items), Int(n)) | (BinaryOp::Mul, Int(n), List(items)) => {
                let times = n.max(0) as usize;
                self.check_repeat(items.len(), times)?;
                let mut out = Vec::with_capacity(items.len() * times);
                for _ in 0..times {
                    out.extend(items.iter().cloned());
                }
                self.charged(Value::list(out))
            }
            (BinaryOp::Div, Int(_), Int(0)) | (BinaryOp::Rem, Int(_), Int(0)) => Err(self
                .fault(FaultKind::ZeroDivisionError, "division by zero")
                .into()),
            (BinaryOp::Div, Int(a), Int(b)) => floor_div(a, b).map(Int).ok_or_else(|| overflow(self)),
            (BinaryOp::Rem, Int(a), Int(b)) => floor_mod(a, b).map(Int).ok_or_else(|| overflow(self)),
            (BinaryOp::Eq, a, b) => Ok(Bool(a == b)),
            (BinaryOp::Ne, a, b) => Ok(Bool(a != b)),
            (op @ (BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge), a, b) => {
                let ordering = self.compare(&a, &b)?;
                let result = match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Bool(result))
            }
            (op @ (BinaryOp::In | BinaryOp::NotIn), needle, haystack) => {
                let found = self.contains(&haystack, &needle)?;
                Ok(Bool(if op == BinaryOp::In { found } else { !found }))
            }
            (op, a, b) => Err(self
                .fault(
                    FaultKind::TypeError,
                    format!(
                        "unsupported operand types for {}: {} and {}",
                        op.symbol(),
                        a.type_name(),
                        b.type_name()
                    ),
                )
                .into()),
        }
    }

    fn check_repeat(&self, unit: usize, times: usize) -> Eval<()> {
        match unit.checked_mul(times) {
            Some(total) if total <= MAX_VALUE_LEN => Ok(()),
            _ => Err(self
                .fault(
                    FaultKind::LimitError,
                    format!("repetition result exceeds the limit of {MAX_VALUE_LEN}"),
                )
                .into()),
        }
    }

    fn compare(&self, a: &Value, b: &Value) -> Eval<std::cmp::Ordering> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
            (Value::Text(x), Value::Text(y)) => Ok(x.cmp(y)),
            (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
            _ => Err(self
                .fault(
                    FaultKind::TypeError,
                    format!("cannot compare {} with {}", a.type_name(), b.type_name()),
                )
                .into()),
        }
    }

    fn contains(&self, haystack: &Value, needle: &Value) -> Eval<bool> {
        match (haystack, needle) {
            (Value::Text(h), Value::Text(n)) => Ok(h.contains(n.as_ref())),
            (Value::List(items), n) => Ok(items.contains(n)),
            (h, n) => Err(self
                .fault(
                    FaultKind::TypeError,
                    format!("cannot test {} membership in {}", n.type_name(), h.type_name()),
                )
                .into()),
        }
    }

    fn index(&self, target: Value, index: Value) -> Eval<Value> {
        let Value::Int(i) = index else {
            return Err(self
                .fault(
                    FaultKind::TypeError,
                    format!("index must be int, not {}", index.type_name()),
                )
                .into());
        };
        match target {
            Value::Text(s) => {
                let len = s.chars().count();
                let pos = self.normalize_index(i, len)?;
                let c = s.chars().nth(pos).unwrap_or_default();
                Ok(Value::text(c.to_string()))
            }
            Value::List(items) => {
                let pos = self.normalize_index(i, items.len())?;
                Ok(items[pos].clone())
            }
            other => Err(self
                .fault(
                    FaultKind::TypeError,
                    format!("{} is not indexable", other.type_name()),
                )
                .into()),
        }
    }

    fn normalize_index(&self, i: i64, len: usize) -> Eval<usize> {
        let len_i = len as i64;
        let pos = if i < 0 { i + len_i } else { i };
        if pos < 0 || pos >= len_i {
            return Err(self
                .fault(
                    FaultKind::IndexError,
                    format!("index {i} out of range for length {len}"),
                )
                .into());
        }
        Ok(pos as usize)
    }

    fn slice(&mut self, target: Value, start: Option<Value>, end: Option<Value>) -> Eval<Value> {
        let start = self.slice_bound(start)?;
        let end = self.slice_bound(end)?;
        match target {
            Value::Text(s) => {
                let (from, to) = clamp_slice(s.chars().count(), start, end);
                Ok(Value::text(char_range(&s, from, to)))
            }
            Value::List(items) => {
                let (from, to) = clamp_slice(items.len(), start, end);
                Ok(Value::list(items[from..to].to_vec()))
            }
            other => Err(self
                .fault(
                    FaultKind::TypeError,
                    format!("{} cannot be sliced", other.type_name()),
                )
                .into()),
        }
    }

    fn slice_bound(&self, bound: Option<Value>) -> Eval<Option<i64>> {
        match bound {
            None | Some(Value::None) => Ok(None),
            Some(Value::Int(n)) => Ok(Some(n)),
            Some(other) => Err(self
                .fault(
                    FaultKind::TypeError,
                    format!("slice bounds must be int, not {}", other.type_name()),
                )
                .into()),
        }
    }

    // ─── Builtins ──────────────────────────────────────────────────────────

    fn call(&mut self, name: &str, args: Vec<Value>) -> Eval<Value> {
        match name {
            "print" => {
                let line = args
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.output.push(&line);
                self.output.push("\n");
                Ok(Value::None)
            }
            "show_vars" => {
                self.arity(name, &args, 0, 0)?;
                let mut listing = format!(
                    "context: text ({} chars)\n",
                    self.context.chars().count()
                );
                for var in self.scratch.names() {
                    if let Some(value) = self.scratch.get(var) {
                        listing.push_str(&describe_var(var, value));
                        listing.push('\n');
                    }
                }
                self.output.push(&listing);
                Ok(Value::None)
            }
            "final" => {
                self.arity(name, &args, 1, 1)?;
                let answer = args.into_iter().next().unwrap_or(Value::None).to_string();
                Err(Halt::Final(answer))
            }
            "recurse" => {
                self.arity(name, &args, 2, 2)?;
                let question = self.text_arg(name, &args, 0)?;
                let text = args[1].to_string();
                let answer = self
                    .hooks
                    .recurse(&question, &text)
                    .map_err(|fault| fault.at(self.line.max(1)))?;
                Ok(Value::text(answer))
            }
            "len" => {
                self.arity(name, &args, 1, 1)?;
                match &args[0] {
                    Value::Text(s) => Ok(Value::Int(s.chars().count() as i64)),
                    Value::List(items) => Ok(Value::Int(items.len() as i64)),
                    other => Err(self.type_error(name, other)),
                }
            }
            "str" => {
                self.arity(name, &args, 1, 1)?;
                self.charged(Value::text(args[0].to_string()))
            }
            "int" => {
                self.arity(name, &args, 1, 1)?;
                match &args[0] {
                    Value::Int(n) => Ok(Value::Int(*n)),
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    Value::Text(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        self.fault(
                            FaultKind::ValueError,
                            format!("invalid integer literal {}", Value::Text(s.clone()).repr()),
                        )
                        .into()
                    }),
                    other => Err(self.type_error(name, other)),
                }
            }
            "lines" => {
                self.arity(name, &args, 1, 1)?;
                let s = self.text_arg(name, &args, 0)?;
                self.charged(text_list(s.lines()))
            }
            "split" => {
                self.arity(name, &args, 1, 2)?;
                let s = self.text_arg(name, &args, 0)?;
                let parts = if args.len() == 2 {
                    let sep = self.text_arg(name, &args, 1)?;
                    if sep.is_empty() {
                        return Err(self.fault(FaultKind::ValueError, "empty separator").into());
                    }
                    text_list(s.split(sep.as_ref()))
                } else {
                    text_list(s.split_whitespace())
                };
                self.charged(parts)
            }
            "join" => {
                self.arity(name, &args, 1, 2)?;
                let Value::List(items) = &args[0] else {
                    return Err(self.type_error(name, &args[0]));
                };
                let sep = if args.len() == 2 {
                    self.text_arg(name, &args, 1)?
                } else {
                    Arc::from("")
                };
                let joined = items
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(sep.as_ref());
                self.charged(Value::text(joined))
            }
            "chunk" => {
                self.arity(name, &args, 2, 2)?;
                let s = self.text_arg(name, &args, 0)?;
                let size = self.positive_arg(name, &args, 1)?;
                let chars: Vec<char> = s.chars().collect();
                let chunks = chars
                    .chunks(size)
                    .map(|c| Value::text(c.iter().collect::<String>()))
                    .collect();
                self.charged(Value::list(chunks))
            }
            "chunk_lines" => {
                self.arity(name, &args, 2, 2)?;
                let s = self.text_arg(name, &args, 0)?;
                let size = self.positive_arg(name, &args, 1)?;
                let lines: Vec<&str> = s.lines().collect();
                let chunks = lines
                    .chunks(size)
                    .map(|c| Value::text(c.join("\n")))
                    .collect();
                self.charged(Value::list(chunks))
            }
            "split_regex" => {
                self.arity(name, &args, 2, 2)?;
                let s = self.text_arg(name, &args, 0)?;
                let re = self.regex_arg(name, &args, 1)?;
                self.charged(text_list(re.split(&s)))
            }
            "grep" => {
                self.arity(name, &args, 2, 2)?;
                let s = self.text_arg(name, &args, 0)?;
                let re = self.regex_arg(name, &args, 1)?;
                self.charged(text_list(s.lines().filter(|l| re.is_match(l))))
            }
            "search" => {
                self.arity(name, &args, 2, 2)?;
                let s = self.text_arg(name, &args, 0)?;
                let re = self.regex_arg(name, &args, 1)?;
                self.charged(text_list(re.find_iter(&s).map(|m| m.as_str())))
            }
            "find" => {
                self.arity(name, &args, 2, 2)?;
                let s = self.text_arg(name, &args, 0)?;
                let needle = self.text_arg(name, &args, 1)?;
                let index = match s.find(needle.as_ref()) {
                    Some(byte) => s[..byte].chars().count() as i64,
                    None => -1,
                };
                Ok(Value::Int(index))
            }
            "count" => {
                self.arity(name, &args, 2, 2)?;
                match (&args[0], &args[1]) {
                    (Value::Text(s), Value::Text(needle)) => {
                        if needle.is_empty() {
                            return Err(self.fault(FaultKind::ValueError, "empty substring").into());
                        }
                        Ok(Value::Int(s.matches(needle.as_ref()).count() as i64))
                    }
                    (Value::List(items), value) => {
                        Ok(Value::Int(items.iter().filter(|v| *v == value).count() as i64))
                    }
                    (other, _) => Err(self.type_error(name, other)),
                }
            }
            "contains" => {
                self.arity(name, &args, 2, 2)?;
                Ok(Value::Bool(self.contains(&args[0], &args[1])?))
            }
            "startswith" | "endswith" => {
                self.arity(name, &args, 2, 2)?;
                let s = self.text_arg(name, &args, 0)?;
                let affix = self.text_arg(name, &args, 1)?;
                let hit = if name == "startswith" {
                    s.starts_with(affix.as_ref())
                } else {
                    s.ends_with(affix.as_ref())
                };
                Ok(Value::Bool(hit))
            }
            "replace" => {
                self.arity(name, &args, 3, 3)?;
                let s = self.text_arg(name, &args, 0)?;
                let from = self.text_arg(name, &args, 1)?;
                let to = self.text_arg(name, &args, 2)?;
                if from.is_empty() {
                    return Err(self.fault(FaultKind::ValueError, "empty pattern").into());
                }
                let occurrences = s.matches(from.as_ref()).count();
                let projected = s.len() + occurrences.saturating_mul(to.len());
                if projected > MAX_VALUE_LEN.saturating_mul(4) {
                    return Err(self
                        .fault(FaultKind::LimitError, "replacement result is too large")
                        .into());
                }
                self.charged(Value::text(s.replace(from.as_ref(), &to)))
            }
            "upper" | "lower" | "strip" => {
                self.arity(name, &args, 1, 1)?;
                let s = self.text_arg(name, &args, 0)?;
                let out = match name {
                    "upper" => s.to_uppercase(),
                    "lower" => s.to_lowercase(),
                    _ => s.trim().to_string(),
                };
                self.charged(Value::text(out))
            }
            "slice" => {
                self.arity(name, &args, 2, 3)?;
                let mut args = args.into_iter();
                let target = args.next().unwrap_or(Value::None);
                let start = args.next();
                let end = args.next();
                self.slice(target, start, end)
            }
            "range" => {
                self.arity(name, &args, 1, 3)?;
                let mut bounds = Vec::with_capacity(args.len());
                for (i, arg) in args.iter().enumerate() {
                    match arg {
                        Value::Int(n) => bounds.push(*n),
                        other => {
                            return Err(self
                                .fault(
                                    FaultKind::TypeError,
                                    format!(
                                        "range() argument {} must be int, not {}",
                                        i + 1,
                                        other.type_name()
                                    ),
                                )
                                .into());
                        }
                    }
                }
                let (start, stop, step) = match bounds.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => (0, 0, 1),
                };
                if step == 0 {
                    return Err(self
                        .fault(FaultKind::ValueError, "range() step must not be zero")
                        .into());
                }
                let span = if step > 0 {
                    (stop as i128 - start as i128 + step as i128 - 1) / step as i128
                } else {
                    (start as i128 - stop as i128 - step as i128 - 1) / (-(step as i128))
                };
                let count = span.max(0);
                if count > MAX_RANGE as i128 {
                    return Err(self
                        .fault(
                            FaultKind::LimitError,
                            format!("range() of {count} items exceeds the limit of {MAX_RANGE}"),
                        )
                        .into());
                }
                let items = (0..count as i64)
                    .map(|i| Value::Int(start + i * step))
                    .collect();
                self.charged(Value::list(items))
            }
            "min" | "max" => {
                if args.is_empty() {
                    return Err(self.arity_error(name, 1, usize::MAX, 0));
                }
                let single_list = matches!(args.as_slice(), [Value::List(_)]);
                let items = if single_list {
                    match args.into_iter().next() {
                        Some(Value::List(items)) => Arc::unwrap_or_clone(items),
                        _ => Vec::new(),
                    }
                } else {
                    args
                };
                if items.is_empty() {
                    return Err(self
                        .fault(FaultKind::ValueError, format!("{name}() of an empty sequence"))
                        .into());
                }
                let mut best = items[0].clone();
                for item in &items[1..] {
                    let ordering = self.compare(item, &best)?;
                    let better = if name == "min" {
                        ordering.is_lt()
                    } else {
                        ordering.is_gt()
                    };
                    if better {
                        best = item.clone();
                    }
                }
                Ok(best)
            }
            other => Err(self
                .fault(FaultKind::NameError, format!("unknown function '{other}'"))
                .into()),
        }
    }

    fn arity(&self, name: &str, args: &[Value], min: usize, max: usize) -> Eval<()> {
        if args.len() < min || args.len() > max {
            return Err(self.arity_error(name, min, max, args.len()));
        }
        Ok(())
    }

    fn arity_error(&self, name: &str, min: usize, max: usize, got: usize) -> Halt {
        let expected = if min == max {
            format!("{min}")
        } else if max == usize::MAX {
            format!("at least {min}")
        } else {
            format!("{min} to {max}")
        };
        self.fault(
            FaultKind::TypeError,
            format!("{name}() takes {expected} argument(s), got {got}"),
        )
        .into()
    }

    fn type_error(&self, name: &str, value: &Value) -> Halt {
        self.fault(
            FaultKind::TypeError,
            format!("{name}() does not accept {}", value.type_name()),
        )
        .into()
    }

    fn text_arg(&self, name: &str, args: &[Value], i: usize) -> Eval<Arc<str>> {
        match args.get(i) {
            Some(Value::Text(s)) => Ok(Arc::clone(s)),
            Some(other) => Err(self
                .fault(
                    FaultKind::TypeError,
                    format!(
                        "{name}() argument {} must be text, not {}",
                        i + 1,
                        other.type_name()
                    ),
                )
                .into()),
            None => Err(self.arity_error(name, i + 1, i + 1, args.len())),
        }
    }

    fn positive_arg(&self, name: &str, args: &[Value], i: usize) -> Eval<usize> {
        match args.get(i) {
            Some(Value::Int(n)) if *n > 0 => Ok(*n as usize),
            Some(Value::Int(n)) => Err(self
                .fault(
                    FaultKind::ValueError,
                    format!("{name}() size must be positive, got {n}"),
                )
                .into()),
            Some(other) => Err(self
                .fault(
                    FaultKind::TypeError,
                    format!(
                        "{name}() argument {} must be int, not {}",
                        i + 1,
                        other.type_name()
                    ),
                )
                .into()),
            None => Err(self.arity_error(name, i + 1, i + 1, args.len())),
        }
    }

    fn regex_arg(&self, name: &str, args: &[Value], i: usize) -> Eval<Regex> {
        let pattern = self.text_arg(name, args, i)?;
        RegexBuilder::new(&pattern)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| {
                self.fault(FaultKind::ValueError, format!("invalid pattern: {e}"))
                    .into()
            })
    }
}

// ─── Helpers ───────────────────────────────────────────────────────────────

fn text_list<'a>(parts: impl Iterator<Item = &'a str>) -> Value {
    Value::list(parts.map(Value::text).collect())
}

fn describe_var(name: &str, value: &Value) -> String {
    match value {
        Value::Text(s) => format!("{name}: text ({} chars)", s.chars().count()),
        Value::List(items) => format!("{name}: list ({} items)", items.len()),
        other => format!("{name}: {} = {}", other.type_name(), other),
    }
}

/// Python-style slice clamping over a sequence of `len` items.
fn clamp_slice(len: usize, start: Option<i64>, end: Option<i64>) -> (usize, usize) {
    let len_i = len as i64;
    let norm = |v: i64| {
        if v < 0 {
            (v + len_i).max(0)
        } else {
            v.min(len_i)
        }
    };
    let from = start.map(norm).unwrap_or(0);
    let to = end.map(norm).unwrap_or(len_i);
    if from >= to {
        (from as usize, from as usize)
    } else {
        (from as usize, to as usize)
    }
}

/// Substring by character positions `[from, to)`.
fn char_range(s: &str, from: usize, to: usize) -> &str {
    let byte_at = |pos: usize| {
        s.char_indices()
            .nth(pos)
            .map(|(b, _)| b)
            .unwrap_or(s.len())
    };
    let start = byte_at(from);
    let end = if to == from { start } else { byte_at(to) };
    &s[start..end]
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}
