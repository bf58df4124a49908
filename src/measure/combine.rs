//! Combine-metric expressions (`<basename>_combineMetrics.ini`).
//!
//! An expression combines existing columns of the same object:
//!
//! ```text
//! [equations]
//! GFP_ratio = GFP_mean / (mCherry_mean + 1)
//! cell_radius = sqrt(cell_area_um2 / 3.14159)
//! ```
//!
//! Supported: `+ - * / ^`, parentheses, numeric literals, column names and
//! the functions `sqrt`, `log`, `log10`, `exp`, `abs`, `min`, `max`.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::io::IoResult;

// ============================================================================
// Expressions
// ============================================================================

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    Number(f64),
    /// Column reference
    Column(String),
    /// Unary minus
    Neg(Box<Expr>),
    /// Binary operation
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Function call
    Call(Function, Vec<Expr>),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `^`
    Pow,
}

/// Whitelisted functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// Square root
    Sqrt,
    /// Natural logarithm
    Log,
    /// Base-10 logarithm
    Log10,
    /// Exponential
    Exp,
    /// Absolute value
    Abs,
    /// Minimum of two values
    Min,
    /// Maximum of two values
    Max,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sqrt" => Function::Sqrt,
            "log" => Function::Log,
            "log10" => Function::Log10,
            "exp" => Function::Exp,
            "abs" => Function::Abs,
            "min" => Function::Min,
            "max" => Function::Max,
            _ => return None,
        })
    }

    fn arity(&self) -> usize {
        match self {
            Function::Min | Function::Max => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
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
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| EngineError::invalid_input(format!("bad number '{}'", text)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(EngineError::invalid_input(format!("unexpected '{}' in '{}'", c, source))),
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
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(EngineError::invalid_input(format!("expected {:?}, found {:?}", token, other))),
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = if *op == '+' { BinaryOp::Add } else { BinaryOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = if *op == '*' { BinaryOp::Mul } else { BinaryOp::Div };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // unary := '-' unary | power
    fn unary(&mut self) -> Result<Expr> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if let Some(Token::Op('+')) = self.peek() {
            self.pos += 1;
            return self.unary();
        }
        self.power()
    }

    // power := atom ('^' unary)?   (right associative)
    fn power(&mut self) -> Result<Expr> {
        let base = self.atom()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Column(name));
                }
                let function = Function::from_name(&name)
                    .ok_or_else(|| EngineError::invalid_input(format!("unknown function '{}'", name)))?;
                self.pos += 1;
                let mut args = vec![self.expr()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                if args.len() != function.arity() {
                    return Err(EngineError::invalid_input(format!(
                        "'{}' takes {} argument(s), got {}",
                        name,
                        function.arity(),
                        args.len()
                    )));
                }
                Ok(Expr::Call(function, args))
            }
            other => Err(EngineError::invalid_input(format!("unexpected {:?}", other))),
        }
    }
}

impl Expr {
    /// Parse an expression.
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            pos: 0,
        };
        let expr = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(EngineError::invalid_input(format!(
                "trailing input in '{}' at {:?}",
                source,
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }

    /// Column names the expression reads.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Column(name) => out.push(name),
            Expr::Neg(inner) => inner.collect_columns(out),
            Expr::Binary(_, a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_columns(out)),
        }
    }

    /// Evaluate against the columns of one object.
    pub fn eval(&self, columns: &BTreeMap<String, f64>) -> std::result::Result<f64, String> {
        Ok(match self {
            Expr::Number(v) => *v,
            Expr::Column(name) => *columns
                .get(name)
                .ok_or_else(|| format!("unknown column '{}'", name))?,
            Expr::Neg(inner) => -inner.eval(columns)?,
            Expr::Binary(op, a, b) => {
                let (a, b) = (a.eval(columns)?, b.eval(columns)?);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                }
            }
            Expr::Call(function, args) => {
                let a = args[0].eval(columns)?;
                match function {
                    Function::Sqrt => a.sqrt(),
                    Function::Log => a.ln(),
                    Function::Log10 => a.log10(),
                    Function::Exp => a.exp(),
                    Function::Abs => a.abs(),
                    Function::Min => a.min(args[1].eval(columns)?),
                    Function::Max => a.max(args[1].eval(columns)?),
                }
            }
        })
    }
}

// ============================================================================
// Combine metrics
// ============================================================================

/// A user-defined column computed from other columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CombineMetric {
    /// Output column name
    pub name: String,
    /// Expression text as written by the user
    pub source: String,
    /// Parsed expression
    pub expr: Expr,
}

impl CombineMetric {
    /// Parse `source` as the definition of column `name`.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let expr = Expr::parse(&source)?;
        Ok(Self {
            name: name.into(),
            source,
            expr,
        })
    }
}

/// Parse the `[equations]` section of a combine-metrics file.
///
/// Lines starting with `;` or `#` are comments. An entry whose expression
/// does not parse is an error.
pub fn parse_ini(text: &str) -> Result<Vec<CombineMetric>> {
    let mut section = String::new();
    let mut metrics = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_string();
            continue;
        }
        if section != "equations" {
            continue;
        }
        let (name, source) = line
            .split_once('=')
            .ok_or_else(|| EngineError::invalid_input(format!("line {}: expected 'name = expression'", n + 1)))?;
        metrics.push(CombineMetric::new(name.trim(), source.trim())?);
    }
    Ok(metrics)
}

/// Write the `[equations]` section.
pub fn format_ini(metrics: &[CombineMetric]) -> String {
    let mut out = String::from("[equations]\n");
    for metric in metrics {
        out.push_str(&format!("{} = {}\n", metric.name, metric.source));
    }
    out
}

/// Read a combine-metrics file; a missing file means no metrics.
pub fn load(path: &Path) -> IoResult<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    Ok(std::fs::read_to_string(path)?)
}
