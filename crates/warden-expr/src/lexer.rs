//! Lexer for alarm expressions.
//!
//! Recognizes:
//! - **Literals**: numbers (`42`, `0.5`, `1e3`), strings (`"web"`, `'web'`),
//!   `true`, `false`, `null`
//! - **Identifiers**: `data`, `ProcessName`, `$value`
//! - **Operators**: `+ - * / %`, `< <= > >=`, `== != === !==`, `&& ||`, `!`, `=>`
//! - **Punctuation**: `. , ( ) [ ]`

use std::str::CharIndices;

use crate::error::{ExprError, ExprResult};

/// Token types in an alarm expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Arrow,

    Dot,
    Comma,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,

    Eof,
}

/// A token together with the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

/// Lexer for alarm expressions.
pub struct Lexer<'a> {
    input: &'a str,
    chars: CharIndices<'a>,
    current: Option<(usize, char)>,
    peeked: Option<(usize, char)>,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given input.
    pub fn new(input: &'a str) -> Self {
        let mut chars = input.char_indices();
        let current = chars.next();
        let peeked = chars.next();
        Self {
            input,
            chars,
            current,
            peeked,
        }
    }

    /// Tokenize the entire input. The last token is always `Eof`.
    pub fn tokenize(&mut self) -> ExprResult<Vec<Spanned>> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> ExprResult<Spanned> {
        self.skip_whitespace();

        let (offset, c) = match self.current {
            None => {
                return Ok(Spanned {
                    token: Token::Eof,
                    offset: self.input.len(),
                });
            }
            Some(pair) => pair,
        };

        let token = match c {
            '(' => self.single(Token::LeftParen),
            ')' => self.single(Token::RightParen),
            '[' => self.single(Token::LeftBracket),
            ']' => self.single(Token::RightBracket),
            ',' => self.single(Token::Comma),
            '.' => self.single(Token::Dot),
            '+' => self.single(Token::Plus),
            '-' => self.single(Token::Minus),
            '*' => self.single(Token::Star),
            '/' => self.single(Token::Slash),
            '%' => self.single(Token::Percent),
            '<' => self.with_optional_eq(Token::Lt, Token::Le),
            '>' => self.with_optional_eq(Token::Gt, Token::Ge),
            '!' => {
                self.advance();
                if self.current_char() == Some('=') {
                    self.advance();
                    if self.current_char() == Some('=') {
                        self.advance();
                    }
                    Token::NotEq
                } else {
                    Token::Bang
                }
            }
            '=' => {
                self.advance();
                match self.current_char() {
                    Some('=') => {
                        self.advance();
                        if self.current_char() == Some('=') {
                            self.advance();
                        }
                        Token::Eq
                    }
                    Some('>') => {
                        self.advance();
                        Token::Arrow
                    }
                    _ => return Err(ExprError::syntax(offset, "assignment is not supported, use '=='")),
                }
            }
            '&' => self.doubled('&', Token::AndAnd, offset)?,
            '|' => self.doubled('|', Token::OrOr, offset)?,
            '"' | '\'' => self.string_literal(c, offset)?,
            c if c.is_ascii_digit() => self.number_literal(offset)?,
            c if c.is_alphabetic() || c == '_' || c == '$' => self.identifier_or_keyword(offset),
            other => {
                return Err(ExprError::syntax(
                    offset,
                    format!("unexpected character '{other}'"),
                ));
            }
        };

        Ok(Spanned { token, offset })
    }

    fn advance(&mut self) {
        self.current = self.peeked.take();
        self.peeked = self.chars.next();
    }

    fn current_char(&self) -> Option<char> {
        self.current.map(|(_, c)| c)
    }

    fn position(&self) -> usize {
        self.current.map(|(i, _)| i).unwrap_or(self.input.len())
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.current_char(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    fn with_optional_eq(&mut self, plain: Token, with_eq: Token) -> Token {
        self.advance();
        if self.current_char() == Some('=') {
            self.advance();
            with_eq
        } else {
            plain
        }
    }

    fn doubled(&mut self, c: char, token: Token, offset: usize) -> ExprResult<Token> {
        self.advance();
        if self.current_char() == Some(c) {
            self.advance();
            Ok(token)
        } else {
            Err(ExprError::syntax(offset, format!("expected '{c}{c}'")))
        }
    }

    fn string_literal(&mut self, quote: char, offset: usize) -> ExprResult<Token> {
        self.advance();
        let mut value = String::new();
        loop {
            match self.current_char() {
                None => return Err(ExprError::syntax(offset, "unterminated string literal")),
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(Token::Str(value));
                }
                Some('\\') => {
                    self.advance();
                    let escaped = match self.current_char() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some(c @ ('\\' | '"' | '\'')) => c,
                        Some(other) => {
                            return Err(ExprError::syntax(
                                self.position(),
                                format!("unknown escape '\\{other}'"),
                            ));
                        }
                        None => {
                            return Err(ExprError::syntax(offset, "unterminated string literal"));
                        }
                    };
                    value.push(escaped);
                    self.advance();
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }

    fn number_literal(&mut self, offset: usize) -> ExprResult<Token> {
        while matches!(self.current_char(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        // A fractional part needs a digit after the dot; `1.length` is not a number.
        if self.current_char() == Some('.')
            && matches!(self.peeked, Some((_, c)) if c.is_ascii_digit())
        {
            self.advance();
            while matches!(self.current_char(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.current_char(), Some('e' | 'E')) {
            self.advance();
            if matches!(self.current_char(), Some('+' | '-')) {
                self.advance();
            }
            if !matches!(self.current_char(), Some(c) if c.is_ascii_digit()) {
                return Err(ExprError::syntax(offset, "malformed exponent"));
            }
            while matches!(self.current_char(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = &self.input[offset..self.position()];
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|e| ExprError::syntax(offset, format!("invalid number {text:?}: {e}")))
    }

    fn identifier_or_keyword(&mut self, offset: usize) -> Token {
        while matches!(self.current_char(), Some(c) if c.is_alphanumeric() || c == '_' || c == '$')
        {
            self.advance();
        }
        match &self.input[offset..self.position()] {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            ident => Token::Ident(ident.to_string()),
        }
    }
}
