// src/expr.rs - Safe numeric expression compiler and evaluator
//
// Formulas and branch conditions are compiled once at configuration-load
// time into an `Expr` tree and evaluated per tick against a binding table.
// Inputs are referenced as `[alias]`; booleans are represented as 0.0/1.0.

use crate::error::{EngineError, Result};
use std::collections::HashMap;

/// Built-in function set available to formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Sin,
    Cos,
    Tan,
    Log,
    Log10,
    Exp,
    Sqrt,
    Abs,
    Round,
    Floor,
    Ceiling,
    Avg,
    Min,
    Max,
    Clamp,
    Scale,
    Deadband,
    Iff,
}

impl Func {
    fn from_name(name: &str) -> Option<Func> {
        Some(match name {
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "tan" => Func::Tan,
            "log" => Func::Log,
            "log10" => Func::Log10,
            "exp" => Func::Exp,
            "sqrt" => Func::Sqrt,
            "abs" => Func::Abs,
            "round" => Func::Round,
            "floor" => Func::Floor,
            "ceiling" => Func::Ceiling,
            "avg" => Func::Avg,
            "min" => Func::Min,
            "max" => Func::Max,
            "clamp" => Func::Clamp,
            "scale" => Func::Scale,
            "deadband" => Func::Deadband,
            "iff" => Func::Iff,
            _ => return None,
        })
    }

    /// (min, max) argument counts; `None` max means variadic.
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Func::Avg | Func::Min | Func::Max => (1, None),
            Func::Clamp | Func::Iff => (3, Some(3)),
            Func::Scale => (5, Some(5)),
            Func::Deadband => (2, Some(2)),
            _ => (1, Some(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

/// Compiled expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    Number(f64),
    Ref(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOpNode),
    Call(CallNode),
}

#[derive(Debug, Clone)]
pub struct BinOpNode {
    op: BinOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
}

#[derive(Debug, Clone)]
pub struct CallNode {
    func: Func,
    args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Ref(String),
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Gt,
    Lt,
    Ge,
    Le,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Bang,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(EngineError::Expression("expected '=='".into()));
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(EngineError::Expression("expected '&&'".into()));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(EngineError::Expression("expected '||'".into()));
                }
            }
            '[' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] as char != ']' {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(EngineError::Expression("unterminated input reference".into()));
                }
                let name = input[start..j].trim();
                if name.is_empty() {
                    return Err(EngineError::Expression("empty input reference".into()));
                }
                tokens.push(Token::Ref(name.to_string()));
                i = j + 1;
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                // optional exponent
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                        j += 1;
                    }
                    if j < bytes.len() && (bytes[j] as char).is_ascii_digit() {
                        i = j;
                        while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text = &input[start..i];
                let n: f64 = text
                    .parse()
                    .map_err(|_| EngineError::Expression(format!("bad number '{}'", text)))?;
                tokens.push(Token::Number(n));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
            }
            _ => {
                return Err(EngineError::Expression(format!(
                    "unexpected character '{}'",
                    c
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(EngineError::Expression(format!(
                "expected {:?}, found {:?}",
                token, other
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = binary(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let rhs = self.parse_equality()?;
            lhs = binary(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.next();
            let rhs = self.parse_comparison()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::Le) => BinOp::Le,
                _ => break,
            };
            self.next();
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.next();
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.next();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Bang) => {
                self.next();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ref(name)) => Ok(Expr::Ref(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let func = Func::from_name(&name)
                    .ok_or_else(|| EngineError::Expression(format!("unknown function '{}'", name)))?;
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.parse_or()?);
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.next();
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(Token::RParen)?;
                let (min, max) = func.arity();
                if args.len() < min || max.map(|m| args.len() > m).unwrap_or(false) {
                    return Err(EngineError::Expression(format!(
                        "function '{}' called with {} arguments",
                        name,
                        args.len()
                    )));
                }
                Ok(Expr::Call(CallNode { func, args }))
            }
            other => Err(EngineError::Expression(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary(BinOpNode {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn truthy(v: f64) -> bool {
    v != 0.0 && !v.is_nan()
}

fn from_bool(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl Expr {
    /// Compile an expression. Configuration-load time only.
    pub fn parse(input: &str) -> Result<Expr> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(EngineError::Expression("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(EngineError::Expression(format!(
                "trailing input after expression at token {}",
                parser.pos
            )));
        }
        Ok(expr)
    }

    /// List the `[alias]` references used by the expression.
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Ref(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Neg(e) | Expr::Not(e) => e.collect_refs(out),
            Expr::Binary(node) => {
                node.lhs.collect_refs(out);
                node.rhs.collect_refs(out);
            }
            Expr::Call(node) => {
                for arg in &node.args {
                    arg.collect_refs(out);
                }
            }
            Expr::Number(_) => {}
        }
    }

    /// Evaluate against a binding table. Division by zero and unknown
    /// references are errors for this tick, never panics.
    pub fn eval(&self, bindings: &HashMap<String, f64>) -> Result<f64> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Ref(name) => bindings.get(name).copied().ok_or_else(|| {
                EngineError::Expression(format!("unbound input reference '[{}]'", name))
            }),
            Expr::Neg(e) => Ok(-e.eval(bindings)?),
            Expr::Not(e) => Ok(from_bool(!truthy(e.eval(bindings)?))),
            Expr::Binary(node) => {
                let l = node.lhs.eval(bindings)?;
                let r = node.rhs.eval(bindings)?;
                Ok(match node.op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => {
                        if r == 0.0 {
                            return Err(EngineError::Expression("division by zero".into()));
                        }
                        l / r
                    }
                    BinOp::Rem => {
                        if r == 0.0 {
                            return Err(EngineError::Expression("modulo by zero".into()));
                        }
                        l % r
                    }
                    BinOp::Gt => from_bool(l > r),
                    BinOp::Lt => from_bool(l < r),
                    BinOp::Ge => from_bool(l >= r),
                    BinOp::Le => from_bool(l <= r),
                    BinOp::Eq => from_bool(l == r),
                    BinOp::Ne => from_bool(l != r),
                    BinOp::And => from_bool(truthy(l) && truthy(r)),
                    BinOp::Or => from_bool(truthy(l) || truthy(r)),
                })
            }
            Expr::Call(node) => {
                let mut args = Vec::with_capacity(node.args.len());
                for arg in &node.args {
                    args.push(arg.eval(bindings)?);
                }
                Ok(match node.func {
                    Func::Sin => args[0].sin(),
                    Func::Cos => args[0].cos(),
                    Func::Tan => args[0].tan(),
                    Func::Log => args[0].ln(),
                    Func::Log10 => args[0].log10(),
                    Func::Exp => args[0].exp(),
                    Func::Sqrt => args[0].sqrt(),
                    Func::Abs => args[0].abs(),
                    Func::Round => args[0].round(),
                    Func::Floor => args[0].floor(),
                    Func::Ceiling => args[0].ceil(),
                    Func::Avg => args.iter().sum::<f64>() / args.len() as f64,
                    Func::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
                    Func::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    Func::Clamp => args[0].clamp(args[1].min(args[2]), args[1].max(args[2])),
                    Func::Scale => {
                        let span = args[2] - args[1];
                        if span == 0.0 {
                            return Err(EngineError::Expression(
                                "scale with zero input span".into(),
                            ));
                        }
                        args[3] + (args[0] - args[1]) / span * (args[4] - args[3])
                    }
                    Func::Deadband => {
                        if args[0].abs() <= args[1].abs() {
                            0.0
                        } else {
                            args[0]
                        }
                    }
                    Func::Iff => {
                        if truthy(args[0]) {
                            args[1]
                        } else {
                            args[2]
                        }
                    }
                })
            }
        }
    }
}
