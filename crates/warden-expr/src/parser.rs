//! Recursive-descent parser for alarm expressions.
//!
//! Precedence, loosest first:
//!
//! ```text
//! ||  →  &&  →  == !=  →  < <= > >=  →  + -  →  * / %  →  ! -  →  . [] ()
//! ```

use serde_json::Value;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{ExprError, ExprResult};
use crate::lexer::{Lexer, Spanned, Token};

/// Deepest tree the parser builds. Evaluation recurses once per level.
pub const MAX_DEPTH: usize = 128;

/// Parse an expression string into an AST.
pub fn parse(input: &str) -> ExprResult<Expr> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_expression()?;
    if parser.current() != &Token::Eof {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Nesting of the node being parsed.
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        self.token_at(self.pos)
    }

    fn token_at(&self, pos: usize) -> &Token {
        self.tokens.get(pos).map(|s| &s.token).unwrap_or(&Token::Eof)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.offset)
            .unwrap_or(0)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: Token) -> ExprResult<()> {
        if self.current() == &expected {
            self.advance();
            Ok(())
        } else {
            Err(ExprError::syntax(
                self.offset(),
                format!("expected {expected:?}, found {:?}", self.current()),
            ))
        }
    }

    fn expect_identifier(&mut self) -> ExprResult<String> {
        match self.current().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(ExprError::syntax(
                self.offset(),
                format!("expected identifier, found {other:?}"),
            )),
        }
    }

    fn unexpected(&self) -> ExprError {
        ExprError::syntax(self.offset(), format!("unexpected token {:?}", self.current()))
    }

    fn descend(&mut self) -> ExprResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::syntax(self.offset(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn parse_expression(&mut self) -> ExprResult<Expr> {
        self.descend()?;
        let expr = self.parse_or()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> ExprResult<Expr>,
        ops: fn(&Token) -> Option<BinaryOp>,
    ) -> ExprResult<Expr> {
        let mut left = next(self)?;
        // Each operator in a chain nests the left operand one level deeper.
        let mut chained = 0;
        while let Some(op) = ops(self.current()) {
            self.advance();
            self.descend()?;
            chained += 1;
            let right = next(self)?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_or(&mut self) -> ExprResult<Expr> {
        self.binary_level(Self::parse_and, |t| match t {
            Token::OrOr => Some(BinaryOp::Or),
            _ => None,
        })
    }

    fn parse_and(&mut self) -> ExprResult<Expr> {
        self.binary_level(Self::parse_equality, |t| match t {
            Token::AndAnd => Some(BinaryOp::And),
            _ => None,
        })
    }

    fn parse_equality(&mut self) -> ExprResult<Expr> {
        self.binary_level(Self::parse_comparison, |t| match t {
            Token::Eq => Some(BinaryOp::Eq),
            Token::NotEq => Some(BinaryOp::NotEq),
            _ => None,
        })
    }

    fn parse_comparison(&mut self) -> ExprResult<Expr> {
        self.binary_level(Self::parse_additive, |t| match t {
            Token::Lt => Some(BinaryOp::Lt),
            Token::Le => Some(BinaryOp::Le),
            Token::Gt => Some(BinaryOp::Gt),
            Token::Ge => Some(BinaryOp::Ge),
            _ => None,
        })
    }

    fn parse_additive(&mut self) -> ExprResult<Expr> {
        self.binary_level(Self::parse_multiplicative, |t| match t {
            Token::Plus => Some(BinaryOp::Add),
            Token::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn parse_multiplicative(&mut self) -> ExprResult<Expr> {
        self.binary_level(Self::parse_unary, |t| match t {
            Token::Star => Some(BinaryOp::Mul),
            Token::Slash => Some(BinaryOp::Div),
            Token::Percent => Some(BinaryOp::Rem),
            _ => None,
        })
    }

    fn parse_unary(&mut self) -> ExprResult<Expr> {
        let op = match self.current() {
            Token::Bang => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.descend()?;
        let expr = self.parse_unary()?;
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_postfix(&mut self) -> ExprResult<Expr> {
        let mut expr = self.parse_primary()?;
        let mut chained = 0;
        loop {
            if matches!(self.current(), Token::Dot | Token::LeftBracket) {
                self.descend()?;
                chained += 1;
            }
            match self.current() {
                Token::Dot => {
                    self.advance();
                    let property = self.expect_identifier()?;
                    if self.current() == &Token::LeftParen {
                        self.advance();
                        let args = self.parse_arguments()?;
                        expr = Expr::Call {
                            object: Box::new(expr),
                            method: property,
                            args,
                        };
                    } else {
                        expr = Expr::Member {
                            object: Box::new(expr),
                            property,
                        };
                    }
                }
                Token::LeftBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(Token::RightBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => {
                    self.depth -= chained;
                    return Ok(expr);
                }
            }
        }
    }

    /// Arguments after the opening parenthesis, including the closing one.
    fn parse_arguments(&mut self) -> ExprResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.current() == &Token::RightParen {
            self.advance();
            return Ok(args);
        }
        loop {
            let arg = if self.at_lambda() {
                self.parse_lambda()?
            } else {
                self.parse_expression()?
            };
            args.push(arg);
            match self.current() {
                Token::Comma => self.advance(),
                Token::RightParen => {
                    self.advance();
                    return Ok(args);
                }
                _ => return Err(self.unexpected()),
            }
        }
    }

    /// `x =>` or `(a, b) =>` ahead?
    fn at_lambda(&self) -> bool {
        match self.current() {
            Token::Ident(_) => self.token_at(self.pos + 1) == &Token::Arrow,
            Token::LeftParen => {
                let mut pos = self.pos + 1;
                loop {
                    match self.token_at(pos) {
                        Token::Ident(_) | Token::Comma => pos += 1,
                        Token::RightParen => return self.token_at(pos + 1) == &Token::Arrow,
                        _ => return false,
                    }
                }
            }
            _ => false,
        }
    }

    fn parse_lambda(&mut self) -> ExprResult<Expr> {
        let mut params = Vec::new();
        if self.current() == &Token::LeftParen {
            self.advance();
            while self.current() != &Token::RightParen {
                params.push(self.expect_identifier()?);
                if self.current() == &Token::Comma {
                    self.advance();
                }
            }
            self.advance();
        } else {
            params.push(self.expect_identifier()?);
        }
        self.expect(Token::Arrow)?;
        let body = self.parse_expression()?;
        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
        })
    }

    fn parse_primary(&mut self) -> ExprResult<Expr> {
        let expr = match self.current().clone() {
            Token::LeftParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(Token::RightParen)?;
                return Ok(expr);
            }
            Token::Number(n) => Expr::Literal(number_literal(n)),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Ident(name) => Expr::Ident(name),
            _ => return Err(self.unexpected()),
        };
        self.advance();
        Ok(expr)
    }
}

/// Integral literals become JSON integers so they render as `3`, not `3.0`.
fn number_literal(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.to_string()))
    }

    #[test]
    fn test_parse_member_comparison() {
        let expr = parse(r#"data.id == "ble""#).unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                left: Box::new(Expr::Member {
                    object: ident("data"),
                    property: "id".into(),
                }),
                op: BinaryOp::Eq,
                right: Box::new(Expr::Literal(Value::String("ble".into()))),
            }
        );
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = parse("a || b && c").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::Or, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_comparison_binds_tighter_than_and() {
        let expr = parse("a > 1 && b < 2").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::And, left, right } => {
                assert!(matches!(*left, Expr::Binary { op: BinaryOp::Gt, .. }));
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::Lt, .. }));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_parse_lambdas() {
        let expr = parse("xs.filter(x => x.ok).length").unwrap();
        match expr {
            Expr::Member { object, property } => {
                assert_eq!(property, "length");
                match *object {
                    Expr::Call { method, args, .. } => {
                        assert_eq!(method, "filter");
                        assert!(matches!(&args[0], Expr::Lambda { params, .. } if params == &["x"]));
                    }
                    other => panic!("unexpected tree: {other:?}"),
                }
            }
            other => panic!("unexpected tree: {other:?}"),
        }

        let expr = parse("xs.reduce((acc, x) => acc + x, 0)").unwrap();
        match expr {
            Expr::Call { args, .. } => {
                assert_eq!(args.len(), 2);
                assert!(matches!(&args[0], Expr::Lambda { params, .. } if params == &["acc", "x"]));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_parenthesized_expression_is_not_a_lambda() {
        let expr = parse("xs.map(x => (x + 1) * 2)").unwrap();
        assert!(matches!(expr, Expr::Call { .. }));
        assert!(parse("(a) + 1").is_ok());
    }

    #[test]
    fn test_computed_index() {
        let expr = parse("b[b.length - 1]").unwrap();
        assert!(matches!(expr, Expr::Index { .. }));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse("a ==").unwrap_err(), ExprError::Syntax { .. }));
        assert!(matches!(parse("(a").unwrap_err(), ExprError::Syntax { .. }));
        assert!(matches!(parse("a b").unwrap_err(), ExprError::Syntax { offset: 2, .. }));
        assert!(matches!(parse("a.").unwrap_err(), ExprError::Syntax { .. }));
        assert!(matches!(parse("").unwrap_err(), ExprError::Syntax { .. }));
        assert!(matches!(parse("{metric}.value > 1").unwrap_err(), ExprError::Syntax { .. }));
    }

    #[test]
    fn test_nesting_limit() {
        let too_deep = |source: &str| match parse(source) {
            Err(ExprError::Syntax { message, .. }) => message.contains("nested too deeply"),
            _ => false,
        };

        assert!(too_deep(&format!("{}a{}", "(".repeat(1000), ")".repeat(1000))));
        assert!(too_deep(&format!("{}true", "!".repeat(200_000))));
        assert!(too_deep(&vec!["a"; 10_000].join(" && ")));
        assert!(too_deep(&format!("a{}", ".b".repeat(1000))));

        assert!(parse(&format!("{}a{}", "(".repeat(20), ")".repeat(20))).is_ok());
        assert!(parse(&format!("{}true", "!".repeat(20))).is_ok());
        assert!(parse(&vec!["a"; 50].join(" + ")).is_ok());
    }
}
