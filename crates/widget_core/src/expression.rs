use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("parse error at offset {position}: {detail}")]
    Parse { position: usize, detail: String },
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("type error: {0}")]
    Type(String),
}

fn parse_err(position: usize, detail: impl Into<String>) -> ExpressionError {
    ExpressionError::Parse {
        position,
        detail: detail.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(raw: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let bytes = raw.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                let op = match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    _ => "/",
                };
                tokens.push((i, Token::Op(op)));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two = bytes.get(i + 1).copied() == Some(b'=');
                let op = match (c, two) {
                    ('=', true) => "==",
                    ('!', true) => "!=",
                    ('<', true) => "<=",
                    ('>', true) => ">=",
                    ('!', false) => "!",
                    ('<', false) => "<",
                    ('>', false) => ">",
                    ('=', false) => return Err(parse_err(i, "expected ==")),
                    _ => unreachable!(),
                };
                tokens.push((i, Token::Op(op)));
                i += if two { 2 } else { 1 };
            }
            '&' | '|' => {
                if bytes.get(i + 1).copied() != Some(c as u8) {
                    return Err(parse_err(i, format!("expected {c}{c}")));
                }
                tokens.push((i, Token::Op(if c == '&' { "&&" } else { "||" })));
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    let Some(found) = raw[i..].chars().next() else {
                        return Err(parse_err(start, "unterminated string"));
                    };
                    match found {
                        '\\' => {
                            match raw[i + 1..].chars().next() {
                                Some(escaped @ ('\\' | '\'' | '"')) => text.push(escaped),
                                _ => return Err(parse_err(i, "invalid escape")),
                            }
                            i += 2;
                        }
                        found if found == quote => {
                            i += 1;
                            break;
                        }
                        found => {
                            text.push(found);
                            i += found.len_utf8();
                        }
                    }
                }
                tokens.push((start, Token::Str(text)));
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let number = raw[start..i]
                    .parse::<f64>()
                    .map_err(|_| parse_err(start, "invalid number"))?;
                tokens.push((start, Token::Number(number)));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push((start, Token::Ident(raw[start..i].to_string())));
            }
            other => return Err(parse_err(i, format!("unexpected character {other:?}"))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, token)| token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map(|(position, _)| *position)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|(_, token)| token.clone());
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn eat_op(&mut self, ops: &[(&'static str, BinaryOp)]) -> Option<BinaryOp> {
        let found = match self.peek() {
            Some(Token::Op(found)) => *found,
            _ => return None,
        };
        for (text, op) in ops {
            if found == *text {
                self.cursor += 1;
                return Some(*op);
            }
        }
        None
    }

    fn binary_chain(
        &mut self,
        ops: &[(&'static str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ExpressionError>,
    ) -> Result<Expr, ExpressionError> {
        let mut lhs = next(self)?;
        while let Some(op) = self.eat_op(ops) {
            let rhs = next(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn expr(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_chain(&[("||", BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_chain(&[("&&", BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_chain(&[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_chain(
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::term,
        )
    }

    fn term(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_chain(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Self::factor)
    }

    fn factor(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_chain(&[("*", BinaryOp::Mul), ("/", BinaryOp::Div)], Self::unary)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if let Some(Token::Op(op @ ("!" | "-"))) = self.peek() {
            let op = if *op == "!" { UnaryOp::Not } else { UnaryOp::Neg };
            self.cursor += 1;
            let operand = self.unary()?;
            return Ok(Expr::Unary(op, Box::new(operand)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Number(number)) => {
                let value = if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
                    Value::from(number as i64)
                } else {
                    Value::from(number)
                };
                Ok(Expr::Literal(value))
            }
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => Ok(Expr::Var(name)),
            },
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(parse_err(position, "unbalanced parenthesis")),
                }
            }
            Some(token) => Err(parse_err(position, format!("unexpected token {token:?}"))),
            None => Err(parse_err(position, "unexpected end of expression")),
        }
    }
}

/// Restricted formula language: literals, context variables, arithmetic,
/// comparisons and boolean connectives. Expressions are parsed to an AST
/// once and interpreted against a value context; no source text is ever
/// generated or evaluated at runtime.
#[derive(Debug, Clone)]
pub struct Expression {
    raw: String,
    root: Expr,
}

impl Expression {
    pub fn parse(raw: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(raw)?;
        if tokens.is_empty() {
            return Err(parse_err(0, "empty expression"));
        }
        let mut parser = Parser {
            tokens,
            cursor: 0,
            end: raw.len(),
        };
        let root = parser.expr()?;
        if parser.peek().is_some() {
            return Err(parse_err(parser.position(), "trailing input"));
        }
        Ok(Self {
            raw: raw.to_string(),
            root,
        })
    }

    pub fn constant(value: Value) -> Self {
        Self {
            raw: value.to_string(),
            root: Expr::Literal(value),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Context variables the expression reads.
    pub fn variables(&self) -> HashSet<String> {
        let mut found = HashSet::new();
        collect_variables(&self.root, &mut found);
        found
    }

    pub fn eval(&self, ctx: &HashMap<String, Value>) -> Result<Value, ExpressionError> {
        eval_expr(&self.root, ctx)
    }

    /// String form for URL/filter building: strings pass through unquoted,
    /// everything else uses its JSON rendering.
    pub fn eval_to_string(&self, ctx: &HashMap<String, Value>) -> Result<String, ExpressionError> {
        Ok(match self.eval(ctx)? {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }
}

fn collect_variables(expr: &Expr, found: &mut HashSet<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Var(name) => {
            found.insert(name.clone());
        }
        Expr::Unary(_, operand) => collect_variables(operand, found),
        Expr::Binary(_, lhs, rhs) => {
            collect_variables(lhs, found);
            collect_variables(rhs, found);
        }
    }
}

fn number_of(value: &Value, op: &str) -> Result<f64, ExpressionError> {
    value
        .as_f64()
        .ok_or_else(|| ExpressionError::Type(format!("{op} needs numbers, got {value}")))
}

fn bool_of(value: &Value, op: &str) -> Result<bool, ExpressionError> {
    value
        .as_bool()
        .ok_or_else(|| ExpressionError::Type(format!("{op} needs booleans, got {value}")))
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(left), Some(right)) => left == right,
        _ => lhs == rhs,
    }
}

fn numeric(result: f64) -> Value {
    if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        Value::from(result as i64)
    } else {
        Value::from(result)
    }
}

fn eval_expr(expr: &Expr, ctx: &HashMap<String, Value>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownVariable(name.clone())),
        Expr::Unary(op, operand) => {
            let operand = eval_expr(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!bool_of(&operand, "!")?)),
                UnaryOp::Neg => Ok(numeric(-number_of(&operand, "-")?)),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            if matches!(op, BinaryOp::And | BinaryOp::Or) {
                let left = bool_of(&eval_expr(lhs, ctx)?, "boolean operator")?;
                // Short-circuit keeps unknown variables on the dead side harmless.
                return match (op, left) {
                    (BinaryOp::And, false) => Ok(Value::Bool(false)),
                    (BinaryOp::Or, true) => Ok(Value::Bool(true)),
                    _ => Ok(Value::Bool(bool_of(
                        &eval_expr(rhs, ctx)?,
                        "boolean operator",
                    )?)),
                };
            }

            let left = eval_expr(lhs, ctx)?;
            let right = eval_expr(rhs, ctx)?;
            match op {
                BinaryOp::Eq => Ok(Value::Bool(loose_eq(&left, &right))),
                BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&left, &right))),
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    compare(*op, &left, &right)
                }
                BinaryOp::Add => match (&left, &right) {
                    (Value::String(lhs_text), Value::String(rhs_text)) => {
                        Ok(Value::String(format!("{lhs_text}{rhs_text}")))
                    }
                    _ => Ok(numeric(number_of(&left, "+")? + number_of(&right, "+")?)),
                },
                BinaryOp::Sub => Ok(numeric(number_of(&left, "-")? - number_of(&right, "-")?)),
                BinaryOp::Mul => Ok(numeric(number_of(&left, "*")? * number_of(&right, "*")?)),
                BinaryOp::Div => {
                    let divisor = number_of(&right, "/")?;
                    if divisor == 0.0 {
                        return Err(ExpressionError::Type("division by zero".to_string()));
                    }
                    Ok(numeric(number_of(&left, "/")? / divisor))
                }
                BinaryOp::And | BinaryOp::Or => unreachable!(),
            }
        }
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    let ordering = match (lhs, rhs) {
        (Value::String(left), Value::String(right)) => left.cmp(right),
        _ => {
            let left = number_of(lhs, "comparison")?;
            let right = number_of(rhs, "comparison")?;
            left.partial_cmp(&right)
                .ok_or_else(|| ExpressionError::Type("incomparable numbers".to_string()))?
        }
    };
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}
