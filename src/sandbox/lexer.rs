/// A lexical token with the 1-based source line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Int(i64),
    Str(String),
    Ident(String),

    // Keywords
    Let,
    If,
    Else,
    For,
    In,
    And,
    Or,
    Not,
    True,
    False,
    None,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semi,
    Newline,

    // Operators
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Int(n) => format!("integer {n}"),
            TokenKind::Str(_) => "string literal".into(),
            TokenKind::Ident(name) => format!("'{name}'"),
            TokenKind::Newline => "end of line".into(),
            TokenKind::Eof => "end of program".into(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::Let => "let",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::For => "for",
            TokenKind::In => "in",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::None => "none",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Dot => ".",
            TokenKind::Semi => ";",
            TokenKind::Assign => "=",
            TokenKind::Eq => "==",
            TokenKind::Ne => "!=",
            TokenKind::Lt => "<",
            TokenKind::Le => "<=",
            TokenKind::Gt => ">",
            TokenKind::Ge => ">=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Int(_)
            | TokenKind::Str(_)
            | TokenKind::Ident(_)
            | TokenKind::Newline
            | TokenKind::Eof => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (line {})", self.message, self.line)
    }
}

fn keyword(word: &str) -> Option<TokenKind> {
    let kind = match word {
        "let" => TokenKind::Let,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "true" | "True" => TokenKind::True,
        "false" | "False" => TokenKind::False,
        "none" | "None" => TokenKind::None,
        _ => return None,
    };
    Some(kind)
}

/// Tokenize program text.
///
/// Newlines inside `(...)` and `[...]` are insignificant so calls and list
/// literals may span lines; inside `{...}` they separate statements.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1usize;
    let mut grouping = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];

        if c == '\n' {
            if grouping == 0 {
                tokens.push(Token {
                    kind: TokenKind::Newline,
                    line,
                });
            }
            line += 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        let start_line = line;

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
                i += 1;
            }
            let digits: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let value = digits.parse::<i64>().map_err(|_| LexError {
                line,
                message: format!("integer literal '{digits}' is out of range"),
            })?;
            if i < chars.len() && (chars[i].is_alphabetic() || chars[i] == '.') {
                let next = chars.get(i + 1).copied().unwrap_or(' ');
                if chars[i] != '.' || next.is_ascii_digit() {
                    return Err(LexError {
                        line,
                        message: "malformed number literal (only integers are supported)".into(),
                    });
                }
            }
            tokens.push(Token {
                kind: TokenKind::Int(value),
                line,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let kind = keyword(&word).unwrap_or(TokenKind::Ident(word));
            tokens.push(Token { kind, line });
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(LexError {
                        line: start_line,
                        message: "unterminated string literal".into(),
                    });
                };
                i += 1;
                if ch == quote {
                    break;
                }
                match ch {
                    '\n' => {
                        return Err(LexError {
                            line: start_line,
                            message: "unterminated string literal".into(),
                        });
                    }
                    '\\' => {
                        let Some(&esc) = chars.get(i) else {
                            return Err(LexError {
                                line: start_line,
                                message: "unterminated string literal".into(),
                            });
                        };
                        i += 1;
                        match esc {
                            'n' => text.push('\n'),
                            't' => text.push('\t'),
                            'r' => text.push('\r'),
                            '0' => text.push('\0'),
                            '\\' => text.push('\\'),
                            '"' => text.push('"'),
                            '\'' => text.push('\''),
                            other => {
                                return Err(LexError {
                                    line,
                                    message: format!("unknown escape sequence '\\{other}'"),
                                });
                            }
                        }
                    }
                    other => text.push(other),
                }
            }
            tokens.push(Token {
                kind: TokenKind::Str(text),
                line: start_line,
            });
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (kind, width) = match (c, next) {
            ('=', Some('=')) => (TokenKind::Eq, 2),
            ('!', Some('=')) => (TokenKind::Ne, 2),
            ('<', Some('=')) => (TokenKind::Le, 2),
            ('>', Some('=')) => (TokenKind::Ge, 2),
            ('=', _) => (TokenKind::Assign, 1),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            (',', _) => (TokenKind::Comma, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('.', _) => (TokenKind::Dot, 1),
            (';', _) => (TokenKind::Semi, 1),
            (other, _) => {
                return Err(LexError {
                    line,
                    message: format!("unexpected character '{other}'"),
                });
            }
        };
        match kind {
            TokenKind::LParen | TokenKind::LBracket => grouping += 1,
            TokenKind::RParen | TokenKind::RBracket => grouping = grouping.saturating_sub(1),
            _ => {}
        }
        tokens.push(Token { kind, line });
        i += width;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        line,
    });
    Ok(tokens)
}
