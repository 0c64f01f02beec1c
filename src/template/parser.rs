//! Tokenizer and recursive-descent parser for template expressions.
//!
//! Precedence, loosest first:
//!
//! ```text
//! or
//! and
//! not
//! == != < <= > >= in, not in, is [not] <test>
//! ~
//! + -
//! unary -
//! postfix: .attr  [index]  | filter(args)  call(args)
//! ```

use super::value::Value;
use super::TemplateError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Pipe,
    Tilde,
    Plus,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Concat,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Filter {
        expr: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Test {
        expr: Box<Expr>,
        name: String,
        negated: bool,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// The dotted path this expression names, when it is a plain reference.
    pub fn path(&self) -> Option<String> {
        match self {
            Expr::Var(name) => Some(name.clone()),
            Expr::Attr(base, attr) => Some(format!("{}.{}", base.path()?, attr)),
            Expr::Index(base, idx) => match idx.as_ref() {
                Expr::Literal(Value::Int(i)) => Some(format!("{}[{}]", base.path()?, i)),
                Expr::Literal(Value::Str(s)) => Some(format!("{}.{}", base.path()?, s)),
                _ => None,
            },
            _ => None,
        }
    }
}

fn syntax(source: &str, message: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        expression: source.to_string(),
        message: message.into(),
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(syntax(src, "unterminated string literal")),
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| syntax(src, "dangling escape"))?;
                        s.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(ch) if *ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(if is_float {
                Token::Float(text.parse().map_err(|_| syntax(src, "bad number"))?)
            } else {
                Token::Int(text.parse().map_err(|_| syntax(src, "integer out of range"))?)
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            (',', _) => (Token::Comma, 1),
            (':', _) => (Token::Colon, 1),
            ('.', _) => (Token::Dot, 1),
            ('|', _) => (Token::Pipe, 1),
            ('~', _) => (Token::Tilde, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            _ => return Err(syntax(src, format!("unexpected character '{}'", c))),
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

/// Parse a single expression.
pub fn parse(src: &str) -> Result<Expr, TemplateError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(syntax(src, "empty expression"));
    }
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(syntax(
            src,
            format!("unexpected trailing token {:?}", parser.tokens[parser.pos]),
        ));
    }
    Ok(expr)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == kw)
    }

    fn peek_keyword_at(&self, offset: usize, kw: &str) -> bool {
        matches!(self.tokens.get(self.pos + offset), Some(Token::Ident(s)) if s == kw)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), TemplateError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}, found {:?}", expected, self.peek())))
        }
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        syntax(self.src, message)
    }

    fn parse_or(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, TemplateError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                Some(Token::Ident(kw)) if kw == "in" => BinaryOp::In,
                Some(Token::Ident(kw)) if kw == "not" && self.peek_keyword_at(1, "in") => {
                    self.pos += 1;
                    BinaryOp::NotIn
                }
                Some(Token::Ident(kw)) if kw == "is" => {
                    self.pos += 1;
                    let negated = self.peek_keyword("not");
                    if negated {
                        self.pos += 1;
                    }
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        other => return Err(self.error(format!("expected test name, found {:?}", other))),
                    };
                    left = Expr::Test {
                        expr: Box::new(left),
                        name,
                        negated,
                    };
                    continue;
                }
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_concat()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_concat(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_additive()?;
        while self.eat(&Token::Tilde) {
            let right = self.parse_additive()?;
            left = Expr::Binary(BinaryOp::Concat, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, TemplateError> {
        if self.eat(&Token::Minus) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    expr = match self.advance() {
                        Some(Token::Ident(attr)) => Expr::Attr(Box::new(expr), attr),
                        Some(Token::Int(i)) => {
                            Expr::Index(Box::new(expr), Box::new(Expr::Literal(Value::Int(i))))
                        }
                        other => {
                            return Err(self.error(format!("expected attribute, found {:?}", other)))
                        }
                    };
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Pipe) => {
                    self.pos += 1;
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(self.error(format!("expected filter name, found {:?}", other)))
                        }
                    };
                    let args = if self.peek() == Some(&Token::LParen) {
                        self.pos += 1;
                        self.parse_args(Token::RParen)?
                    } else {
                        Vec::new()
                    };
                    expr = Expr::Filter {
                        expr: Box::new(expr),
                        name,
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Comma-separated expressions up to `close`; the opener is already consumed.
    fn parse_args(&mut self, close: Token) -> Result<Vec<Expr>, TemplateError> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat(&close) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
            // Trailing comma.
            if self.eat(&close) {
                return Ok(args);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, TemplateError> {
        match self.advance() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => Ok(Expr::List(self.parse_args(Token::RBracket)?)),
            Some(Token::LBrace) => {
                let mut pairs = Vec::new();
                if self.eat(&Token::RBrace) {
                    return Ok(Expr::Map(pairs));
                }
                loop {
                    let key = self.parse_or()?;
                    self.expect(Token::Colon)?;
                    let value = self.parse_or()?;
                    pairs.push((key, value));
                    if self.eat(&Token::RBrace) {
                        return Ok(Expr::Map(pairs));
                    }
                    self.expect(Token::Comma)?;
                }
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "none" | "None" | "null" => Ok(Expr::Literal(Value::None)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let args = self.parse_args(Token::RParen)?;
                    Ok(Expr::Call { name, args })
                }
                _ => Ok(Expr::Var(name)),
            },
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn var(name: &str) -> Box<Expr> {
        Box::new(Expr::Var(name.to_string()))
    }

    #[test]
    fn test_parse_attribute_chain() {
        let expr = parse("facts.date_time.epoch").unwrap();
        assert_eq!(expr.path().as_deref(), Some("facts.date_time.epoch"));
    }

    #[test]
    fn test_parse_precedence() {
        let expr = parse("a == 1 or b and not c").unwrap();
        let Expr::Binary(BinaryOp::Or, left, right) = expr else {
            panic!("expected or at the root");
        };
        assert_eq!(
            *left,
            Expr::Binary(BinaryOp::Eq, var("a"), Box::new(Expr::Literal(Value::Int(1))))
        );
        assert_eq!(
            *right,
            Expr::Binary(
                BinaryOp::And,
                var("b"),
                Box::new(Expr::Unary(UnaryOp::Not, var("c")))
            )
        );
    }

    #[test]
    fn test_parse_not_in_and_tests() {
        assert!(matches!(
            parse("'x' not in items").unwrap(),
            Expr::Binary(BinaryOp::NotIn, _, _)
        ));
        assert_eq!(
            parse("foo is not defined").unwrap(),
            Expr::Test {
                expr: var("foo"),
                name: "defined".into(),
                negated: true
            }
        );
    }

    #[test]
    fn test_parse_filters_and_calls() {
        let expr = parse("lookup('file', path) | trim | default('x')").unwrap();
        let Expr::Filter { name, expr: inner, .. } = expr else {
            panic!("expected filter");
        };
        assert_eq!(name, "default");
        assert!(matches!(*inner, Expr::Filter { ref name, .. } if name == "trim"));
    }

    #[test]
    fn test_parse_collections() {
        assert_eq!(
            parse("[1, 'a',]").unwrap(),
            Expr::List(vec![
                Expr::Literal(Value::Int(1)),
                Expr::Literal(Value::Str("a".into()))
            ])
        );
        assert!(matches!(parse("{'k': v}").unwrap(), Expr::Map(ref p) if p.len() == 1));
        assert!(matches!(parse("items[0]").unwrap(), Expr::Index(_, _)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("a ==").is_err());
        assert!(parse("'unterminated").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("x | ").is_err());
    }
}
