// Scanner for Rill source text.
//
// Produces a flat token sequence with line numbers and stops at the
// first invalid character or unterminated block comment. Keywords are
// reclassified identifiers; two-character operators are matched before
// their one-character prefixes.

use regex::Regex;
use std::fmt;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // Literals
    Integer,
    Float,
    Char,
    Bool,

    // Names
    Ident,
    Type,

    // Keywords
    Const,
    Var,
    Print,
    Return,
    Break,
    Continue,
    If,
    Else,
    While,
    Func,
    Import,

    // Two-character operators
    Le,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,

    // One-character operators and punctuation
    Caret,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Gt,
    Assign,
    Semi,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Bang,
    Backtick,

    Eof,
}


#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: usize,
}

impl Token {
    fn new(kind: TokenKind, lexeme: &str, line: usize) -> Token {
        Token { kind, lexeme: lexeme.to_string(), line }
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum LexError {
    InvalidChar(char, usize),
    BadCharLiteral(usize),
    UnterminatedComment(usize),
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LexError::InvalidChar(c, line) => {
                write!(f, "line {}: invalid character {:?}", line, c)
            }
            LexError::BadCharLiteral(line) => {
                write!(f, "line {}: malformed character literal", line)
            }
            LexError::UnterminatedComment(line) => {
                write!(f, "line {}: unterminated block comment", line)
            }
        }
    }
}


lazy_static! {
    // A float needs at least one digit adjacent to the dot.
    static ref FLOAT_RE: Regex = Regex::new(r"^(\d+\.\d*|\.\d+)").unwrap();
    static ref INT_RE: Regex = Regex::new(r"^\d+").unwrap();
    // 'c', a single-character escape, or a hex escape. The raw quoted
    // lexeme is retained; decode_char turns it into a char later.
    static ref CHAR_RE: Regex = Regex::new(r"^'(\\x[0-9A-Fa-f]+|\\.|[^'\\\n])'").unwrap();
}


fn keyword(word: &str) -> Option<TokenKind> {
    match word {
        "const" => Some(TokenKind::Const),
        "var" => Some(TokenKind::Var),
        "print" => Some(TokenKind::Print),
        "return" => Some(TokenKind::Return),
        "break" => Some(TokenKind::Break),
        "continue" => Some(TokenKind::Continue),
        "if" => Some(TokenKind::If),
        "else" => Some(TokenKind::Else),
        "while" => Some(TokenKind::While),
        "func" => Some(TokenKind::Func),
        "import" => Some(TokenKind::Import),
        "true" | "false" => Some(TokenKind::Bool),
        "int" | "float" | "char" | "bool" => Some(TokenKind::Type),
        _ => None,
    }
}

fn two_char(pair: &str) -> Option<TokenKind> {
    match pair {
        "<=" => Some(TokenKind::Le),
        ">=" => Some(TokenKind::Ge),
        "==" => Some(TokenKind::EqEq),
        "!=" => Some(TokenKind::Ne),
        "&&" => Some(TokenKind::AndAnd),
        "||" => Some(TokenKind::OrOr),
        _ => None,
    }
}

fn one_char(c: char) -> Option<TokenKind> {
    match c {
        '^' => Some(TokenKind::Caret),
        '+' => Some(TokenKind::Plus),
        '-' => Some(TokenKind::Minus),
        '*' => Some(TokenKind::Star),
        '/' => Some(TokenKind::Slash),
        '<' => Some(TokenKind::Lt),
        '>' => Some(TokenKind::Gt),
        '=' => Some(TokenKind::Assign),
        ';' => Some(TokenKind::Semi),
        '(' => Some(TokenKind::LParen),
        ')' => Some(TokenKind::RParen),
        '{' => Some(TokenKind::LBrace),
        '}' => Some(TokenKind::RBrace),
        ',' => Some(TokenKind::Comma),
        '!' => Some(TokenKind::Bang),
        '`' => Some(TokenKind::Backtick),
        _ => None,
    }
}


pub fn tokenize(text: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut index = 0;
    let mut line = 1;

    while index < text.len() {
        let rest = &text[index..];
        let c = match rest.chars().next() {
            Some(c) => c,
            None => break,
        };

        if c == ' ' || c == '\t' {
            index += 1;
            continue;
        }
        if c == '\n' {
            index += 1;
            line += 1;
            continue;
        }
        if c == '\r' {
            index += 1;
            continue;
        }
        if rest.starts_with("//") {
            match rest.find('\n') {
                Some(offset) => index += offset,
                None => break,
            }
            continue;
        }
        if rest.starts_with("/*") {
            match rest.find("*/") {
                Some(offset) => {
                    line += rest[..offset].matches('\n').count();
                    index += offset + 2;
                }
                None => return Err(LexError::UnterminatedComment(line)),
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let end = rest
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(rest.len());
            let word = &rest[..end];
            let kind = keyword(word).unwrap_or(TokenKind::Ident);
            tokens.push(Token::new(kind, word, line));
            index += end;
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            if let Some(m) = FLOAT_RE.find(rest) {
                tokens.push(Token::new(TokenKind::Float, m.as_str(), line));
                index += m.end();
                continue;
            }
            if let Some(m) = INT_RE.find(rest) {
                tokens.push(Token::new(TokenKind::Integer, m.as_str(), line));
                index += m.end();
                continue;
            }
            // A bare dot matches neither numeric pattern.
            return Err(LexError::InvalidChar(c, line));
        }
        if c == '\'' {
            match CHAR_RE.find(rest) {
                Some(m) => {
                    tokens.push(Token::new(TokenKind::Char, m.as_str(), line));
                    index += m.end();
                    continue;
                }
                None => return Err(LexError::BadCharLiteral(line)),
            }
        }
        if c.is_ascii() {
            if rest.len() >= 2 && rest.is_char_boundary(2) {
                if let Some(kind) = two_char(&rest[..2]) {
                    tokens.push(Token::new(kind, &rest[..2], line));
                    index += 2;
                    continue;
                }
            }
            if let Some(kind) = one_char(c) {
                tokens.push(Token::new(kind, &rest[..1], line));
                index += 1;
                continue;
            }
        }
        return Err(LexError::InvalidChar(c, line));
    }

    tokens.push(Token::new(TokenKind::Eof, "", line));
    Ok(tokens)
}


// Decode the retained quoted lexeme of a character literal.
pub fn decode_char(lexeme: &str) -> Option<char> {
    let inner = lexeme.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut chars = inner.chars();
    match chars.next()? {
        '\\' => match chars.next()? {
            'x' => {
                let code = u32::from_str_radix(chars.as_str(), 16).ok()?;
                std::char::from_u32(code)
            }
            'n' => Some('\n'),
            't' => Some('\t'),
            'r' => Some('\r'),
            '0' => Some('\0'),
            other => Some(other),
        },
        only => {
            if chars.next().is_none() {
                Some(only)
            } else {
                None
            }
        }
    }
}
