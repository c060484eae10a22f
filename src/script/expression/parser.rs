//! Tokenizer and recursive-descent parser for the expression language
//!
//! Precedence, loosest first: `||`, `&&`, comparison, `+ -`, `* / %`,
//! unary `! -`, then postfix member/index access.

use crate::script::error::ErrorLocation;
use crate::value::Value;

/// Position of a token, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub row: usize,
    pub column: usize,
}

impl Pos {
    pub fn location(self) -> ErrorLocation {
        ErrorLocation::at(self.row, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call { name: String, args: Vec<Expr>, pos: Pos },
    Unary(UnaryOp, Box<Expr>),
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr>, pos: Pos },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub pos: Pos,
}

impl ParseError {
    fn new(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    End,
}

const PUNCTUATION: [&str; 23] = [
    "==", "!=", "<=", ">=", "&&", "||", "(", ")", "[", "]", "{", "}", ",", ".", ":", "+", "-", "*", "/", "%", "<",
    ">", "!",
];

fn tokenize(source: &str) -> Result<Vec<(Token, Pos)>, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut row = 1;
    let mut line_start = 0;

    while i < chars.len() {
        let c = chars[i];
        let pos = Pos {
            row,
            column: i - line_start + 1,
        };

        if c == '\n' {
            row += 1;
            i += 1;
            line_start = i;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
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
            let token = if is_float {
                text.parse().map(Token::Float).ok()
            } else {
                text.parse().map(Token::Int).ok()
            };
            tokens.push((token.ok_or_else(|| ParseError::new(format!("Invalid number {}", text), pos))?, pos));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((Token::Ident(chars[start..i].iter().collect()), pos));
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                let Some(&next) = chars.get(i) else {
                    return Err(ParseError::new("Unterminated string literal", pos));
                };
                i += 1;
                match next {
                    '\\' => {
                        let escaped = chars
                            .get(i)
                            .copied()
                            .ok_or_else(|| ParseError::new("Unterminated string literal", pos))?;
                        i += 1;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                    }
                    _ if next == quote => break,
                    _ => text.push(next),
                }
            }
            tokens.push((Token::Str(text), pos));
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match PUNCTUATION.iter().find(|p| rest.starts_with(**p)) {
            Some(p) => {
                tokens.push((Token::Punct(*p), pos));
                i += p.len();
            }
            None => return Err(ParseError::new(format!("Unexpected character '{}'", c), pos)),
        }
    }

    let end = Pos {
        row,
        column: chars.len() - line_start + 1,
    };
    tokens.push((Token::End, end));
    Ok(tokens)
}

static END: Token = Token::End;

/// Deepest expression tree the parser builds
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<(Token, Pos)>,
    current: usize,
    depth: usize,
}

/// Parse one expression; an empty source parses to `null`
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        current: 0,
        depth: 0,
    };
    if parser.peek() == &Token::End {
        return Ok(Expr::Literal(Value::Null));
    }
    let expr = parser.or()?;
    match parser.peek() {
        Token::End => Ok(expr),
        other => Err(ParseError::new(format!("Unexpected {}", describe(other)), parser.pos())),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Int(i) => i.to_string(),
        Token::Float(f) => f.to_string(),
        Token::Str(s) => format!("'{}'", s),
        Token::Ident(name) => name.clone(),
        Token::Punct(p) => format!("'{}'", p),
        Token::End => "end of expression".to_string(),
    }
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.current).map_or(&END, |(token, _)| token)
    }

    fn pos(&self) -> Pos {
        self.tokens
            .get(self.current)
            .or_else(|| self.tokens.last())
            .map_or_else(Pos::default, |(_, pos)| *pos)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.current < self.tokens.len() {
            self.current += 1;
        }
        token
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Token::Punct(p) if *p == punct) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<(), ParseError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(ParseError::new(
                format!("Expected '{}' but found {}", punct, describe(self.peek())),
                self.pos(),
            ))
        }
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(ParseError::new("Expression nested too deeply", self.pos()));
        }
        self.depth += 1;
        Ok(())
    }

    fn nested(&mut self, parse: fn(&mut Self) -> Result<Expr, ParseError>) -> Result<Expr, ParseError> {
        self.descend()?;
        let expr = parse(self);
        self.depth -= 1;
        expr
    }

    // each operator deepens the left-leaning tree
    fn binary_level(
        &mut self,
        operators: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let mut left = next(self)?;
        let mut wrapped = 0;
        'outer: loop {
            for (punct, op) in operators {
                let pos = self.pos();
                if self.eat(punct) {
                    self.descend()?;
                    wrapped += 1;
                    let right = next(self)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                        pos,
                    };
                    continue 'outer;
                }
            }
            self.depth -= wrapped;
            return Ok(left);
        }
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        self.nested(|parser| parser.binary_level(&[("||", BinaryOp::Or)], Self::and))
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(&[("&&", BinaryOp::And)], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            &[
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::Ne),
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.nested(Self::unary)?)));
        }
        if self.eat("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.nested(Self::unary)?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        let mut wrapped = 0;
        loop {
            if self.eat(".") {
                self.descend()?;
                wrapped += 1;
                let pos = self.pos();
                match self.advance() {
                    Token::Ident(name) => expr = Expr::Member(Box::new(expr), name),
                    other => return Err(ParseError::new(format!("Expected a name after '.', found {}", describe(&other)), pos)),
                }
            } else if self.eat("[") {
                self.descend()?;
                wrapped += 1;
                let index = self.or()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                self.depth -= wrapped;
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let pos = self.pos();
        match self.advance() {
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.eat("(") => {
                    let args = self.list_until(")")?;
                    Ok(Expr::Call { name, args, pos })
                }
                _ => Ok(Expr::Ident(name)),
            },
            Token::Punct("(") => {
                let inner = self.or()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Punct("[") => Ok(Expr::List(self.list_until("]")?)),
            Token::Punct("{") => self.map_literal(),
            other => Err(ParseError::new(format!("Unexpected {}", describe(&other)), pos)),
        }
    }

    fn list_until(&mut self, close: &str) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.or()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(",")?;
        }
    }

    fn map_literal(&mut self) -> Result<Expr, ParseError> {
        let mut entries = Vec::new();
        if self.eat("}") {
            return Ok(Expr::Map(entries));
        }
        loop {
            let pos = self.pos();
            let key = match self.advance() {
                Token::Ident(key) | Token::Str(key) => key,
                other => return Err(ParseError::new(format!("Expected a map key, found {}", describe(&other)), pos)),
            };
            self.expect(":")?;
            entries.push((key, self.or()?));
            if self.eat("}") {
                return Ok(Expr::Map(entries));
            }
            self.expect(",")?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let expr = parse("1 + 2 * 3 == 7 && !false").unwrap();
        let Expr::Binary { op: BinaryOp::And, left, .. } = expr else {
            panic!("expected &&");
        };
        assert!(matches!(*left, Expr::Binary { op: BinaryOp::Eq, .. }));
    }

    #[test]
    fn test_postfix_and_calls() {
        let expr = parse("upper(this.owner.name)").unwrap();
        let Expr::Call { name, args, .. } = expr else {
            panic!("expected call");
        };
        assert_eq!(name, "upper");
        assert_eq!(
            args[0],
            Expr::Member(
                Box::new(Expr::Member(Box::new(Expr::Ident("this".into())), "owner".into())),
                "name".into()
            )
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse("").unwrap(), Expr::Literal(Value::Null));
        assert_eq!(parse("'it\\'s'").unwrap(), Expr::Literal(Value::from("it's")));
        assert!(matches!(parse("{ x: 1, 'y': [1, 2.5] }").unwrap(), Expr::Map(ref e) if e.len() == 2));
    }

    #[test]
    fn test_errors_carry_positions() {
        let err = parse("1 +\n  )").unwrap_err();
        assert_eq!(err.pos, Pos { row: 2, column: 3 });

        let err = parse("'open").unwrap_err();
        assert_eq!(err.message, "Unterminated string literal");
        assert!(parse("1 2").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let parens = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_eq!(parse(&parens).unwrap_err().message, "Expression nested too deeply");

        let negations = format!("{}1", "-".repeat(100_000));
        assert_eq!(parse(&negations).unwrap_err().message, "Expression nested too deeply");

        let chain = format!("1{}", " + 1".repeat(100_000));
        assert_eq!(parse(&chain).unwrap_err().message, "Expression nested too deeply");

        let members = format!("this{}", ".next".repeat(100_000));
        assert_eq!(parse(&members).unwrap_err().message, "Expression nested too deeply");

        let lists = format!("{}{}", "[".repeat(50_000), "]".repeat(50_000));
        assert_eq!(parse(&lists).unwrap_err().message, "Expression nested too deeply");
    }

    #[test]
    fn test_moderate_nesting_still_parses() {
        let parens = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(parse(&parens).unwrap(), Expr::Literal(Value::Int(1)));

        let chain = format!("1{}", " + 1".repeat(60));
        assert!(matches!(parse(&chain).unwrap(), Expr::Binary { op: BinaryOp::Add, .. }));
    }
}
