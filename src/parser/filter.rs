use chrono::{DateTime, NaiveDate, NaiveTime};
use uuid::Uuid;

use crate::ast::{BinaryOp, Expr, LambdaOp, UnaryOp};
use crate::error::{Error, Result};
use crate::lexer::{Token, TokenKind, tokenize};
use crate::value::{EdmType, Value, parse_duration};

/// Parse a complete `$filter`-style expression.
pub fn parse_expression(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = ExprParser { tokens, pos: 0 };
    let expr = parser.parse_expr(0)?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Binding powers, lowest to highest: or < and < not < comparison/has/in <
/// additive < multiplicative < unary minus < primary.
fn infix_binding_power(tok: &Token) -> Option<(BinaryOp, u8)> {
    if tok.kind != TokenKind::Keyword {
        return None;
    }
    let entry = match tok.lexeme.as_str() {
        "or" => (BinaryOp::Or, 1),
        "and" => (BinaryOp::And, 2),
        "eq" => (BinaryOp::Eq, 4),
        "ne" => (BinaryOp::Ne, 4),
        "gt" => (BinaryOp::Gt, 4),
        "ge" => (BinaryOp::Ge, 4),
        "lt" => (BinaryOp::Lt, 4),
        "le" => (BinaryOp::Le, 4),
        "has" => (BinaryOp::Has, 4),
        "add" => (BinaryOp::Add, 5),
        "sub" => (BinaryOp::Sub, 5),
        "mul" => (BinaryOp::Mul, 6),
        "div" => (BinaryOp::Div, 6),
        "mod" => (BinaryOp::Mod, 6),
        _ => return None,
    };
    Some(entry)
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_eof(&self) -> Result<()> {
        if self.peek().kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(self.unexpected("end of expression"))
        }
    }

    fn unexpected(&self, what: &str) -> Error {
        let tok = self.peek();
        Error::validation(format!(
            "expected {what} at offset {}, found {:?}",
            tok.pos,
            if tok.kind == TokenKind::Eof {
                "end of input"
            } else {
                tok.lexeme.as_str()
            }
        ))
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            // `in (...)` sits at comparison precedence.
            if self.peek().is_keyword("in") && min_bp < 4 {
                self.advance();
                lhs = self.parse_in_list(lhs)?;
                continue;
            }
            let Some((op, bp)) = infix_binding_power(self.peek()) else {
                break;
            };
            if bp <= min_bp {
                break;
            }
            self.advance();
            let rhs = self.parse_expr(bp)?;
            lhs = Expr::Binary {
                op,
                left: Box::new(lhs),
                right: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_in_list(&mut self, lhs: Expr) -> Result<Expr> {
        self.expect(TokenKind::LParen, "( after in")?;
        let mut list = Vec::new();
        if !self.eat(TokenKind::RParen) {
            loop {
                list.push(self.parse_expr(0)?);
                if self.eat(TokenKind::RParen) {
                    break;
                }
                self.expect(TokenKind::Comma, ", or ) in in-list")?;
            }
        }
        Ok(Expr::In {
            expr: Box::new(lhs),
            list,
        })
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek().is_keyword("not") {
            self.advance();
            let operand = self.parse_expr(3)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.peek().kind == TokenKind::Minus {
            self.advance();
            let operand = self.parse_expr(6)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr(0)?;
                self.expect(TokenKind::RParen, ")")?;
                Ok(inner)
            }
            TokenKind::At => {
                self.advance();
                let name = self.expect(TokenKind::Ident, "alias name after @")?;
                Ok(Expr::Alias(name.lexeme))
            }
            TokenKind::Dollar => {
                // `$it` range-variable reference inside lambdas.
                self.advance();
                let name = self.expect(TokenKind::Ident, "identifier after $")?;
                if name.lexeme != "it" {
                    return Err(Error::validation(format!(
                        "unknown system identifier ${}",
                        name.lexeme
                    )));
                }
                let mut segments = vec!["$it".to_string()];
                while self.eat(TokenKind::Slash) {
                    segments.push(self.expect(TokenKind::Ident, "path segment")?.lexeme);
                }
                Ok(Expr::Property(segments))
            }
            TokenKind::Keyword => match tok.lexeme.as_str() {
                "null" => {
                    self.advance();
                    Ok(Expr::literal(Value::Null, EdmType::String))
                }
                "true" => {
                    self.advance();
                    Ok(Expr::literal(Value::Boolean(true), EdmType::Boolean))
                }
                "false" => {
                    self.advance();
                    Ok(Expr::literal(Value::Boolean(false), EdmType::Boolean))
                }
                // Functional arithmetic form: add(Price,10).
                "add" | "sub" | "mul" | "div" | "mod"
                    if self.tokens.get(self.pos + 1).map(|t| t.kind) == Some(TokenKind::LParen) =>
                {
                    let op = match tok.lexeme.as_str() {
                        "add" => BinaryOp::Add,
                        "sub" => BinaryOp::Sub,
                        "mul" => BinaryOp::Mul,
                        "div" => BinaryOp::Div,
                        _ => BinaryOp::Mod,
                    };
                    self.advance();
                    self.advance();
                    let left = self.parse_expr(0)?;
                    self.expect(TokenKind::Comma, ", between arguments")?;
                    let right = self.parse_expr(0)?;
                    self.expect(TokenKind::RParen, ")")?;
                    Ok(Expr::Binary {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    })
                }
                _ => Err(self.unexpected("an expression")),
            },
            TokenKind::Ident => self.parse_path_or_call(),
            _ => self.parse_literal(),
        }
    }

    /// Property path, function call, or lambda over a navigation path.
    fn parse_path_or_call(&mut self) -> Result<Expr> {
        let first = self.advance();
        let mut segments = vec![first.lexeme];

        // Single identifier directly followed by `(` is a function call.
        if segments.len() == 1 && self.peek().kind == TokenKind::LParen {
            return self.parse_call(segments.remove(0));
        }

        while self.eat(TokenKind::Slash) {
            let seg = self.expect(TokenKind::Ident, "path segment")?;
            if (seg.lexeme == "any" || seg.lexeme == "all")
                && self.peek().kind == TokenKind::LParen
            {
                let op = if seg.lexeme == "any" {
                    LambdaOp::Any
                } else {
                    LambdaOp::All
                };
                return self.parse_lambda(op, segments);
            }
            segments.push(seg.lexeme);
        }
        Ok(Expr::Property(segments))
    }

    fn parse_call(&mut self, name: String) -> Result<Expr> {
        self.expect(TokenKind::LParen, "(")?;
        let mut args = Vec::new();
        if !self.eat(TokenKind::RParen) {
            loop {
                args.push(self.parse_expr(0)?);
                if self.eat(TokenKind::RParen) {
                    break;
                }
                self.expect(TokenKind::Comma, ", or ) in argument list")?;
            }
        }
        // cast/isof carry a trailing qualified type name.
        if name == "cast" || name == "isof" {
            let ty = match args.pop() {
                Some(Expr::Property(path)) if path.len() == 1 => path.into_iter().next().unwrap(),
                _ => {
                    return Err(Error::validation(format!(
                        "{name}() requires a qualified type name as its last argument"
                    )));
                }
            };
            let expr = match args.len() {
                0 => None,
                1 => Some(Box::new(args.remove(0))),
                _ => {
                    return Err(Error::validation(format!(
                        "{name}() accepts at most one expression argument"
                    )));
                }
            };
            return Ok(if name == "cast" {
                Expr::Cast { expr, ty }
            } else {
                Expr::IsOf { expr, ty }
            });
        }
        Ok(Expr::Call { name, args })
    }

    fn parse_lambda(&mut self, op: LambdaOp, target: Vec<String>) -> Result<Expr> {
        self.expect(TokenKind::LParen, "(")?;
        if self.eat(TokenKind::RParen) {
            // Bare any() — "collection is non-empty".
            return Ok(Expr::Lambda {
                op,
                range_var: String::new(),
                target,
                predicate: None,
            });
        }
        let range_var = self.expect(TokenKind::Ident, "lambda range variable")?.lexeme;
        self.expect(TokenKind::Colon, ": after range variable")?;
        let predicate = self.parse_expr(0)?;
        self.expect(TokenKind::RParen, ")")?;
        Ok(Expr::Lambda {
            op,
            range_var,
            target,
            predicate: Some(Box::new(predicate)),
        })
    }

    fn parse_literal(&mut self) -> Result<Expr> {
        let tok = self.advance();
        let expr = match tok.kind {
            TokenKind::Int => {
                let n: i64 = tok
                    .lexeme
                    .parse()
                    .map_err(|_| Error::validation(format!("invalid integer: {}", tok.lexeme)))?;
                let ty = if i32::try_from(n).is_ok() {
                    EdmType::Int32
                } else {
                    EdmType::Int64
                };
                Expr::literal(Value::Int(n), ty)
            }
            TokenKind::Decimal => {
                let d: f64 = tok
                    .lexeme
                    .parse()
                    .map_err(|_| Error::validation(format!("invalid decimal: {}", tok.lexeme)))?;
                Expr::literal(Value::Double(d), EdmType::Decimal)
            }
            TokenKind::Float => {
                let d: f64 = tok
                    .lexeme
                    .parse()
                    .map_err(|_| Error::validation(format!("invalid float: {}", tok.lexeme)))?;
                Expr::literal(Value::Double(d), EdmType::Double)
            }
            TokenKind::Str => Expr::literal(Value::String(tok.lexeme), EdmType::String),
            TokenKind::Guid => {
                let g: Uuid = tok
                    .lexeme
                    .parse()
                    .map_err(|_| Error::validation(format!("invalid guid: {}", tok.lexeme)))?;
                Expr::literal(Value::Guid(g), EdmType::Guid)
            }
            TokenKind::Date => {
                let d: NaiveDate = tok
                    .lexeme
                    .parse()
                    .map_err(|_| Error::validation(format!("invalid date: {}", tok.lexeme)))?;
                Expr::literal(Value::Date(d), EdmType::Date)
            }
            TokenKind::Time => {
                let t = NaiveTime::parse_from_str(&tok.lexeme, "%H:%M:%S%.f")
                    .map_err(|_| Error::validation(format!("invalid time: {}", tok.lexeme)))?;
                Expr::literal(Value::Time(t), EdmType::TimeOfDay)
            }
            TokenKind::DateTimeOffset => {
                let dt = DateTime::parse_from_rfc3339(&tok.lexeme).map_err(|_| {
                    Error::validation(format!("invalid datetimeoffset: {}", tok.lexeme))
                })?;
                Expr::literal(Value::DateTime(dt), EdmType::DateTimeOffset)
            }
            TokenKind::Duration => {
                let us = parse_duration(&tok.lexeme).ok_or_else(|| {
                    Error::validation(format!("invalid duration: {}", tok.lexeme))
                })?;
                Expr::literal(Value::Duration(us), EdmType::Duration)
            }
            TokenKind::Geo => Expr::literal(Value::String(tok.lexeme), EdmType::String),
            _ => return Err(self.unexpected("an expression")),
        };
        Ok(expr)
    }
}
