use super::lexer::{tokenize, LexError, Token, TokenKind};

/// Maximum nesting of blocks and sub-expressions in one program.
pub const MAX_NESTING: usize = 64;

/// A parsed program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub line: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Let {
        name: String,
        value: Expr,
    },
    Assign {
        name: String,
        value: Expr,
    },
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    List(Vec<Expr>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Method {
        receiver: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// `x.name` without a call. Parsed so the policy can name it; never executed.
    Attr {
        receiver: Box<Expr>,
        name: String,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        target: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (line {})", self.message, self.line)
    }
}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        Self {
            line: err.line,
            message: err.message,
        }
    }
}

/// Lex and parse in one step.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse_program()
}

/// Recursive-descent parser over a token stream.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

type PResult<T> = Result<T, ParseError>;

static EOF: TokenKind = TokenKind::Eof;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    pub fn parse_program(mut self) -> PResult<Program> {
        let stmts = self.parse_stmts(false)?;
        Ok(Program { stmts })
    }

    // ─── Token helpers ─────────────────────────────────────────────────────

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&EOF)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.kind)
            .unwrap_or(&EOF)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, context: &str) -> PResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected {} {context}, found {}",
                kind.describe(),
                self.peek().describe()
            )))
        }
    }

    fn expect_ident(&mut self, context: &str) -> PResult<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!(
                "expected a name {context}, found {}",
                other.describe()
            ))),
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line(),
            message: message.into(),
        }
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error(format!("program nests deeper than {MAX_NESTING} levels")));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), TokenKind::Newline | TokenKind::Semi) {
            self.advance();
        }
    }

    // ─── Statements ────────────────────────────────────────────────────────

    fn parse_stmts(&mut self, in_block: bool) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                TokenKind::Eof if in_block => {
                    return Err(self.error("unclosed block: expected '}'"));
                }
                TokenKind::Eof => break,
                TokenKind::RBrace if in_block => break,
                TokenKind::RBrace => return Err(self.error("unmatched '}'")),
                _ => {}
            }
            stmts.push(self.parse_stmt()?);
            match self.peek() {
                TokenKind::Newline | TokenKind::Semi | TokenKind::Eof => {}
                TokenKind::RBrace if in_block => {}
                other => {
                    return Err(self.error(format!(
                        "expected end of statement, found {}",
                        other.describe()
                    )));
                }
            }
        }
        Ok(stmts)
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.enter()?;
        self.expect(&TokenKind::LBrace, "to open a block")?;
        let stmts = self.parse_stmts(true)?;
        self.expect(&TokenKind::RBrace, "to close a block")?;
        self.leave();
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let kind = match self.peek() {
            TokenKind::Let => {
                self.advance();
                let name = self.expect_ident("after 'let'")?;
                self.expect(&TokenKind::Assign, "after the variable name")?;
                let value = self.parse_expr()?;
                StmtKind::Let { name, value }
            }
            TokenKind::Ident(_) if self.peek_at(1) == &TokenKind::Assign => {
                let name = self.expect_ident("")?;
                self.advance();
                let value = self.parse_expr()?;
                StmtKind::Assign { name, value }
            }
            TokenKind::If => self.parse_if()?,
            TokenKind::For => {
                self.advance();
                let var = self.expect_ident("after 'for'")?;
                self.expect(&TokenKind::In, "after the loop variable")?;
                let iter = self.parse_expr()?;
                let body = self.parse_block()?;
                StmtKind::For { var, iter, body }
            }
            TokenKind::Else => return Err(self.error("'else' without a matching 'if'")),
            _ => StmtKind::Expr(self.parse_expr()?),
        };
        Ok(Stmt { line, kind })
    }

    fn parse_if(&mut self) -> PResult<StmtKind> {
        self.advance();
        let cond = self.parse_expr()?;
        let then_branch = self.parse_block()?;

        // `else` may sit on the line after the closing brace.
        let mut lookahead = 0;
        while self.peek_at(lookahead) == &TokenKind::Newline {
            lookahead += 1;
        }
        let else_branch = if self.peek_at(lookahead) == &TokenKind::Else {
            self.pos += lookahead;
            self.advance();
            if self.peek() == &TokenKind::If {
                self.enter()?;
                let line = self.line();
                let nested = self.parse_if()?;
                self.leave();
                vec![Stmt { line, kind: nested }]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };

        Ok(StmtKind::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    // ─── Expressions (lowest to highest precedence) ────────────────────────

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = self.parse_or()?;
        self.leave();
        Ok(expr)
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_and()?;
        let mut chained = 0;
        while self.eat(&TokenKind::Or) {
            self.enter()?;
            chained += 1;
            let rhs = self.parse_and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        self.depth -= chained;
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_not()?;
        let mut chained = 0;
        while self.eat(&TokenKind::And) {
            self.enter()?;
            chained += 1;
            let rhs = self.parse_not()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        self.depth -= chained;
        Ok(lhs)
    }

    fn parse_not(&mut self) -> PResult<Expr> {
        if self.eat(&TokenKind::Not) {
            self.enter()?;
            let expr = self.parse_not()?;
            self.leave();
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_additive()?;
        let mut chained = 0;
        loop {
            let op = match (self.peek(), self.peek_at(1)) {
                (TokenKind::Eq, _) => BinaryOp::Eq,
                (TokenKind::Ne, _) => BinaryOp::Ne,
                (TokenKind::Lt, _) => BinaryOp::Lt,
                (TokenKind::Le, _) => BinaryOp::Le,
                (TokenKind::Gt, _) => BinaryOp::Gt,
                (TokenKind::Ge, _) => BinaryOp::Ge,
                (TokenKind::In, _) => BinaryOp::In,
                (TokenKind::Not, TokenKind::In) => {
                    self.advance();
                    BinaryOp::NotIn
                }
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth -= chained;
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth -= chained;
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        let mut chained = 0;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth -= chained;
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        if self.eat(&TokenKind::Minus) {
            self.enter()?;
            let expr = self.parse_unary()?;
            self.leave();
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        let mut chained = 0;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    self.enter()?;
                    chained += 1;
                    let name = self.expect_ident("after '.'")?;
                    if self.eat(&TokenKind::LParen) {
                        let args = self.parse_args(&TokenKind::RParen)?;
                        expr = Expr::Method {
                            receiver: Box::new(expr),
                            name,
                            args,
                        };
                    } else {
                        expr = Expr::Attr {
                            receiver: Box::new(expr),
                            name,
                        };
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    self.enter()?;
                    chained += 1;
                    expr = self.parse_subscript(expr)?;
                }
                TokenKind::LParen => {
                    return Err(self.error("only named functions can be called"));
                }
                _ => break,
            }
        }
        self.depth -= chained;
        Ok(expr)
    }

    fn parse_subscript(&mut self, target: Expr) -> PResult<Expr> {
        let start = if self.peek() == &TokenKind::Colon {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        if self.eat(&TokenKind::Colon) {
            let end = if self.peek() == &TokenKind::RBracket {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            self.expect(&TokenKind::RBracket, "to close the slice")?;
            return Ok(Expr::Slice {
                target: Box::new(target),
                start,
                end,
            });
        }
        self.expect(&TokenKind::RBracket, "to close the index")?;
        match start {
            Some(index) => Ok(Expr::Index {
                target: Box::new(target),
                index,
            }),
            None => Err(self.error("empty index")),
        }
    }

    fn parse_args(&mut self, close: &TokenKind) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(close) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(close) {
                return Ok(args);
            }
            self.expect(&TokenKind::Comma, "between arguments")?;
            // Trailing comma.
            if self.eat(close) {
                return Ok(args);
            }
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        match self.advance() {
            TokenKind::Int(n) => Ok(Expr::Int(n)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::True => Ok(Expr::Bool(true)),
            TokenKind::False => Ok(Expr::Bool(false)),
            TokenKind::None => Ok(Expr::None),
            TokenKind::Ident(name) => {
                if self.eat(&TokenKind::LParen) {
                    let args = self.parse_args(&TokenKind::RParen)?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Name(name))
                }
            }
            TokenKind::LParen => {
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "to close the parenthesis")?;
                Ok(expr)
            }
            TokenKind::LBracket => Ok(Expr::List(self.parse_args(&TokenKind::RBracket)?)),
            other => {
                // Report at the offending token, not the one after it.
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("unexpected {}", other.describe())))
            }
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_expr(src: &str) -> Expr {
        let program = parse(src).unwrap();
        assert_eq!(program.stmts.len(), 1);
        match program.stmts.into_iter().next().unwrap().kind {
            StmtKind::Expr(e) => e,
            other => panic!("expected expression, got {other:?}"),
        }
    }

    #[test]
    fn parses_let_and_assign() {
        let program = parse("let x = 1\nx = x + 2; print(x)").unwrap();
        assert_eq!(program.stmts.len(), 3);
        assert!(matches!(program.stmts[0].kind, StmtKind::Let { .. }));
        assert!(matches!(program.stmts[1].kind, StmtKind::Assign { .. }));
        assert_eq!(program.stmts[2].line, 2);
    }

    #[test]
    fn precedence_mul_over_add() {
        let expr = single_expr("1 + 2 * 3");
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                rhs,
                ..
            } => assert!(matches!(
                *rhs,
                Expr::Binary {
                    op: BinaryOp::Mul,
                    ..
                }
            )),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn not_in_is_one_operator() {
        let expr = single_expr("'a' not in xs");
        assert!(matches!(
            expr,
            Expr::Binary {
                op: BinaryOp::NotIn,
                ..
            }
        ));
    }

    #[test]
    fn method_attr_index_and_slice() {
        assert!(matches!(single_expr("s.upper()"), Expr::Method { .. }));
        assert!(matches!(single_expr("s.__class__"), Expr::Attr { .. }));
        assert!(matches!(single_expr("xs[-1]"), Expr::Index { .. }));
        match single_expr("context[:100]") {
            Expr::Slice { start, end, .. } => {
                assert!(start.is_none());
                assert_eq!(end.as_deref(), Some(&Expr::Int(100)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn if_else_if_chain() {
        let program = parse("if a { print(1) }\nelse if b { print(2) } else { print(3) }").unwrap();
        match &program.stmts[0].kind {
            StmtKind::If { else_branch, .. } => {
                assert_eq!(else_branch.len(), 1);
                match &else_branch[0].kind {
                    StmtKind::If { else_branch, .. } => assert_eq!(else_branch.len(), 1),
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn for_loop_with_multiline_body() {
        let program = parse("for c in chunks {\n  print(c)\n  n = n + 1\n}").unwrap();
        match &program.stmts[0].kind {
            StmtKind::For { var, body, .. } => {
                assert_eq!(var, "c");
                assert_eq!(body.len(), 2);
                assert_eq!(body[1].line, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn multiline_call_arguments() {
        let expr = single_expr("recurse(\n  'summarize',\n  chunk,\n)");
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "recurse");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_carry_lines() {
        let err = parse("let x = 1\nlet = 2").unwrap_err();
        assert_eq!(err.line, 2);

        let err = parse("if x { print(1)").unwrap_err();
        assert!(err.message.contains("unclosed block"));

        assert!(parse("print(1) print(2)").is_err());
        assert!(parse("}").is_err());
        assert!(parse("else { }").is_err());
        assert!(parse("(f)(1)").is_err());
        assert!(parse("xs[]").is_err());
    }

    #[test]
    fn python_statements_do_not_parse() {
        assert!(parse("def f():\n    return 1").is_err());
        assert!(parse("while True:\n    pass").is_err());
    }

    #[test]
    fn nesting_limit_enforced() {
        let deep = format!("{}1{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        let err = parse(&deep).unwrap_err();
        assert!(err.message.contains("nests deeper"));

        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert!(parse(&shallow).is_ok());

        let long_chain = vec!["1"; MAX_NESTING + 2].join(" + ");
        assert!(parse(&long_chain).is_err());

        let negations = format!("{}1", "-".repeat(MAX_NESTING + 1));
        assert!(parse(&negations).is_err());
    }

    #[test]
    fn empty_program_is_empty() {
        assert!(parse("").unwrap().stmts.is_empty());
        assert!(parse("\n# only a comment\n;").unwrap().stmts.is_empty());
    }
}
