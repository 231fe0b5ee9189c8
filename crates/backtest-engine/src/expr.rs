//! Recursive-descent parser and evaluator for the `expr` formula DSL used by
//! `expr` signals and conditions.
//!
//! Grammar (high to low precedence): unary `-`, `*` `/`, `+` `-`, comparisons,
//! `not`, `and`, `or`. `IDENT(args)[offset]` calls into the indicator
//! registry; bare `IDENT[offset]` reads a bar column; `.COMPONENT` selects
//! one output of a multi-output indicator; `[-k]` shifts a series back `k`
//! bars.

use std::collections::HashMap;

use indicator_registry::{Bar as IndicatorBar, IndicatorRegistry, ParamValue};

use crate::error::ExpressionError;
use crate::models::Bar;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
    And,
    Or,
    Not,
    Eof,
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    src: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            chars: src.chars().collect(),
            pos: 0,
            src,
        }
    }

    fn line_col(&self, pos: usize) -> (usize, usize) {
        let mut line = 1;
        let mut col = 1;
        for &ch in self.chars.iter().take(pos) {
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn tokenize(&mut self) -> Result<Vec<(Token, usize)>, ExpressionError> {
        let mut tokens = Vec::new();
        loop {
            while matches!(self.peek(), Some(c) if c.is_whitespace()) {
                self.pos += 1;
            }
            let start = self.pos;
            let Some(ch) = self.peek() else {
                tokens.push((Token::Eof, start));
                break;
            };
            let token = match ch {
                '(' => {
                    self.pos += 1;
                    Token::LParen
                }
                ')' => {
                    self.pos += 1;
                    Token::RParen
                }
                '[' => {
                    self.pos += 1;
                    Token::LBracket
                }
                ']' => {
                    self.pos += 1;
                    Token::RBracket
                }
                ',' => {
                    self.pos += 1;
                    Token::Comma
                }
                '.' => {
                    self.pos += 1;
                    Token::Dot
                }
                '+' => {
                    self.pos += 1;
                    Token::Plus
                }
                '-' => {
                    self.pos += 1;
                    Token::Minus
                }
                '*' => {
                    self.pos += 1;
                    Token::Star
                }
                '/' => {
                    self.pos += 1;
                    Token::Slash
                }
                '<' => {
                    self.pos += 1;
                    if self.peek() == Some('=') {
                        self.pos += 1;
                        Token::Le
                    } else {
                        Token::Lt
                    }
                }
                '>' => {
                    self.pos += 1;
                    if self.peek() == Some('=') {
                        self.pos += 1;
                        Token::Ge
                    } else {
                        Token::Gt
                    }
                }
                '=' => {
                    self.pos += 1;
                    if self.peek() == Some('=') {
                        self.pos += 1;
                    }
                    Token::Eq
                }
                '!' => {
                    self.pos += 1;
                    if self.peek() == Some('=') {
                        self.pos += 1;
                        Token::Ne
                    } else {
                        let (line, column) = self.line_col(start);
                        return Err(ExpressionError::UnexpectedChar { ch: '!', line, column });
                    }
                }
                c if c.is_ascii_digit() => {
                    let begin = self.pos;
                    while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                        self.pos += 1;
                    }
                    let text: String = self.chars[begin..self.pos].iter().collect();
                    let value = text.parse::<f64>().map_err(|_| {
                        let (line, column) = self.line_col(begin);
                        ExpressionError::UnexpectedChar { ch: 'n', line, column }
                    })?;
                    Token::Number(value)
                }
                c if c.is_alphabetic() || c == '_' => {
                    let begin = self.pos;
                    while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
                        self.pos += 1;
                    }
                    let text: String = self.chars[begin..self.pos].iter().collect();
                    match text.as_str() {
                        "and" => Token::And,
                        "or" => Token::Or,
                        "not" => Token::Not,
                        _ => Token::Ident(text),
                    }
                }
                other => {
                    let (line, column) = self.line_col(start);
                    return Err(ExpressionError::UnexpectedChar { ch: other, line, column });
                }
            };
            tokens.push((token, start));
        }
        Ok(tokens)
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Column { name: String, offset: i64 },
    Call {
        name: String,
        args: Vec<Expr>,
        component: Option<String>,
        offset: i64,
    },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    BoolOp(BoolOp, Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
}

struct Parser<'a> {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    lexer: &'a Lexer<'a>,
}

impl<'a> Parser<'a> {
    fn current(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].0.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token, label: &str) -> Result<(), ExpressionError> {
        if self.current() == expected {
            self.advance();
            Ok(())
        } else {
            let offset = self.tokens[self.pos].1;
            let (line, column) = self.lexer.line_col(offset);
            Err(ExpressionError::ExpectedToken {
                expected: label.to_string(),
                line,
                column,
            })
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while matches!(self.current(), Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::BoolOp(BoolOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while matches!(self.current(), Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::BoolOp(BoolOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.current(), Token::Not) {
            self.advance();
            let inner = self.parse_not()?;
            Ok(Expr::Not(Box::new(inner)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_additive()?;
        let op = match self.current() {
            Token::Lt => Some(CmpOp::Lt),
            Token::Le => Some(CmpOp::Le),
            Token::Eq => Some(CmpOp::Eq),
            Token::Ge => Some(CmpOp::Ge),
            Token::Gt => Some(CmpOp::Gt),
            Token::Ne => Some(CmpOp::Ne),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_additive()?;
            Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
        } else {
            Ok(left)
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::BinOp(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::BinOp(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.current(), Token::Minus) {
            self.advance();
            let inner = self.parse_unary()?;
            Ok(Expr::Neg(Box::new(inner)))
        } else {
            self.parse_postfix()
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let primary = self.parse_primary()?;
        Ok(primary)
    }

    fn parse_signed_int(&mut self) -> Result<i64, ExpressionError> {
        let negative = matches!(self.current(), Token::Minus);
        if negative {
            self.advance();
        }
        match self.advance() {
            Token::Number(n) => Ok(if negative { -(n as i64) } else { n as i64 }),
            _ => {
                let offset = self.tokens[self.pos.saturating_sub(1)].1;
                let (line, column) = self.lexer.line_col(offset);
                Err(ExpressionError::ExpectedToken {
                    expected: "integer offset".to_string(),
                    line,
                    column,
                })
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.current().clone() {
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen, ")")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                self.advance();
                let mut args = Vec::new();
                let mut is_call = false;
                if matches!(self.current(), Token::LParen) {
                    is_call = true;
                    self.advance();
                    if !matches!(self.current(), Token::RParen) {
                        args.push(self.parse_expr()?);
                        while matches!(self.current(), Token::Comma) {
                            self.advance();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(&Token::RParen, ")")?;
                }
                let mut component = None;
                if matches!(self.current(), Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Token::Ident(c) => component = Some(c),
                        _ => {
                            let offset = self.tokens[self.pos.saturating_sub(1)].1;
                            let (line, column) = self.lexer.line_col(offset);
                            return Err(ExpressionError::ExpectedToken {
                                expected: "component name".to_string(),
                                line,
                                column,
                            });
                        }
                    }
                }
                let mut offset = 0;
                if matches!(self.current(), Token::LBracket) {
                    self.advance();
                    offset = self.parse_signed_int()?;
                    self.expect(&Token::RBracket, "]")?;
                }
                if is_call {
                    Ok(Expr::Call { name, args, component, offset })
                } else {
                    Ok(Expr::Column { name, offset })
                }
            }
            _ => {
                let offset = self.tokens[self.pos].1;
                let (line, column) = self.lexer.line_col(offset);
                Err(ExpressionError::ExpectedToken {
                    expected: "expression".to_string(),
                    line,
                    column,
                })
            }
        }
    }
}

fn shift(series: &[f64], offset: i64) -> Vec<f64> {
    if offset <= 0 {
        return series.to_vec();
    }
    let k = offset as usize;
    let n = series.len();
    let mut out = vec![f64::NAN; n];
    for i in k..n {
        out[i] = series[i - k];
    }
    out
}

fn column_series(bars: &[Bar], name: &str) -> Option<Vec<f64>> {
    use rust_decimal::prelude::ToPrimitive;
    let f = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
    let series = match name {
        "close" => bars.iter().map(|b| f(b.close)).collect(),
        "open" => bars.iter().map(|b| f(b.open)).collect(),
        "high" => bars.iter().map(|b| f(b.high)).collect(),
        "low" => bars.iter().map(|b| f(b.low)).collect(),
        "volume" => bars.iter().map(|b| b.volume).collect(),
        "hl2" => bars.iter().map(|b| (f(b.high) + f(b.low)) / 2.0).collect(),
        "hlc3" => bars
            .iter()
            .map(|b| (f(b.high) + f(b.low) + f(b.close)) / 3.0)
            .collect(),
        "ohlc4" => bars
            .iter()
            .map(|b| (f(b.open) + f(b.high) + f(b.low) + f(b.close)) / 4.0)
            .collect(),
        _ => return None,
    };
    Some(series)
}

fn to_indicator_bars(bars: &[Bar]) -> Vec<IndicatorBar> {
    use rust_decimal::prelude::ToPrimitive;
    let f = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
    bars.iter()
        .map(|b| IndicatorBar {
            open: f(b.open),
            high: f(b.high),
            low: f(b.low),
            close: f(b.close),
            volume: b.volume,
        })
        .collect()
}

fn eval_node(
    expr: &Expr,
    bars: &[Bar],
    registry: &dyn IndicatorRegistry,
    len: usize,
) -> Result<Vec<f64>, ExpressionError> {
    match expr {
        Expr::Number(n) => Ok(vec![*n; len]),
        Expr::Column { name, offset } => {
            let series = column_series(bars, name)
                .ok_or_else(|| ExpressionError::UnknownIdentifier(name.clone()))?;
            Ok(shift(&series, *offset))
        }
        Expr::Call { name, args, component, offset } => {
            let spec = registry
                .spec(name)
                .ok_or_else(|| ExpressionError::UnknownIdentifier(name.clone()))?
                .clone();
            let mut params: HashMap<String, ParamValue> = HashMap::new();
            for (i, arg) in args.iter().enumerate() {
                if let Some(param_def) = spec.params.get(i) {
                    if let Expr::Number(n) = arg {
                        params.insert(
                            param_def.name.to_string(),
                            ParamValue::Float(*n),
                        );
                    }
                }
            }
            let indicator_bars = to_indicator_bars(bars);
            let output = registry
                .compute(name, &indicator_bars, &params)
                .map_err(ExpressionError::from)?;
            let component_name = component
                .clone()
                .unwrap_or_else(|| spec.default_component.to_string());
            let series = output
                .component(&component_name)
                .ok_or_else(|| ExpressionError::UnknownIdentifier(format!("{name}.{component_name}")))?
                .to_vec();
            Ok(shift(&series, *offset))
        }
        Expr::Neg(inner) => {
            let v = eval_node(inner, bars, registry, len)?;
            Ok(v.into_iter().map(|x| -x).collect())
        }
        Expr::Not(inner) => {
            let v = eval_node(inner, bars, registry, len)?;
            Ok(v.into_iter().map(|x| if truthy(x) { 0.0 } else { 1.0 }).collect())
        }
        Expr::BinOp(op, left, right) => {
            let l = eval_node(left, bars, registry, len)?;
            let r = eval_node(right, bars, registry, len)?;
            Ok(l.iter()
                .zip(r.iter())
                .map(|(&a, &b)| match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                })
                .collect())
        }
        Expr::BoolOp(op, left, right) => {
            let l = eval_node(left, bars, registry, len)?;
            let r = eval_node(right, bars, registry, len)?;
            Ok(l.iter()
                .zip(r.iter())
                .map(|(&a, &b)| {
                    let result = match op {
                        BoolOp::And => truthy(a) && truthy(b),
                        BoolOp::Or => truthy(a) || truthy(b),
                    };
                    if result { 1.0 } else { 0.0 }
                })
                .collect())
        }
        Expr::Cmp(op, left, right) => {
            let l = eval_node(left, bars, registry, len)?;
            let r = eval_node(right, bars, registry, len)?;
            Ok(l.iter()
                .zip(r.iter())
                .map(|(&a, &b)| {
                    if a.is_nan() || b.is_nan() {
                        return 0.0;
                    }
                    let result = match op {
                        CmpOp::Lt => a < b,
                        CmpOp::Le => a <= b,
                        CmpOp::Eq => (a - b).abs() < f64::EPSILON,
                        CmpOp::Ge => a >= b,
                        CmpOp::Gt => a > b,
                        CmpOp::Ne => (a - b).abs() >= f64::EPSILON,
                    };
                    if result { 1.0 } else { 0.0 }
                })
                .collect())
        }
    }
}

fn truthy(value: f64) -> bool {
    value.is_finite() && value != 0.0
}

/// Parses and evaluates a formula against a bar series, producing one
/// numeric value per bar. Comparisons and boolean operators yield 0.0/1.0.
pub fn eval_formula(
    formula: &str,
    bars: &[Bar],
    registry: &dyn IndicatorRegistry,
) -> Result<Vec<f64>, ExpressionError> {
    let lexer = Lexer::new(formula);
    let mut tokenizer = Lexer::new(formula);
    let tokens = tokenizer.tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        lexer: &lexer,
    };
    let ast = parser.parse_expr()?;
    if !matches!(parser.current(), Token::Eof) {
        let offset = parser.tokens[parser.pos].1;
        let (line, column) = lexer.line_col(offset);
        return Err(ExpressionError::ExpectedToken {
            expected: "end of expression".to_string(),
            line,
            column,
        });
    }
    eval_node(&ast, bars, registry, bars.len())
}

/// Evaluates a formula to a boolean series (non-zero, non-NaN is true).
pub fn eval_formula_bool(
    formula: &str,
    bars: &[Bar],
    registry: &dyn IndicatorRegistry,
) -> Result<Vec<bool>, ExpressionError> {
    let values = eval_formula(formula, bars, registry)?;
    Ok(values.into_iter().map(truthy).collect())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use indicator_registry::DefaultIndicatorRegistry;
    use rust_decimal_macros::dec;

    use super::*;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                close: rust_decimal::Decimal::try_from(c).unwrap(),
                volume: 0.0,
            })
            .collect()
    }

    #[test]
    fn arithmetic_respects_precedence() {
        let registry = DefaultIndicatorRegistry::new();
        let values = eval_formula("2 + 3 * 4", &bars(&[0.0]), &registry).unwrap();
        assert_eq!(values, vec![14.0]);
    }

    #[test]
    fn parentheses_override_precedence() {
        let registry = DefaultIndicatorRegistry::new();
        let values = eval_formula("(2 + 3) * 4", &bars(&[0.0]), &registry).unwrap();
        assert_eq!(values, vec![20.0]);
    }

    #[test]
    fn column_reference_reads_close_per_bar() {
        let registry = DefaultIndicatorRegistry::new();
        let values = eval_formula("close", &bars(&[100.0, 101.0, 102.0]), &registry).unwrap();
        assert_eq!(values, vec![100.0, 101.0, 102.0]);
    }

    #[test]
    fn bracket_offset_shifts_series_back_and_pads_with_nan() {
        let registry = DefaultIndicatorRegistry::new();
        let values = eval_formula("close[1]", &bars(&[100.0, 101.0, 102.0]), &registry).unwrap();
        assert!(values[0].is_nan());
        assert_eq!(values[1], 100.0);
        assert_eq!(values[2], 101.0);
    }

    #[test]
    fn comparison_yields_zero_or_one() {
        let registry = DefaultIndicatorRegistry::new();
        let values = eval_formula("close > 100", &bars(&[99.0, 100.0, 101.0]), &registry).unwrap();
        assert_eq!(values, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn boolean_and_or_short_circuit_truthiness() {
        let registry = DefaultIndicatorRegistry::new();
        let b = bars(&[1.0]);
        assert_eq!(eval_formula("1 and 1", &b, &registry).unwrap(), vec![1.0]);
        assert_eq!(eval_formula("1 and 0", &b, &registry).unwrap(), vec![0.0]);
        assert_eq!(eval_formula("0 or 1", &b, &registry).unwrap(), vec![1.0]);
        assert_eq!(eval_formula("not 0", &b, &registry).unwrap(), vec![1.0]);
    }

    #[test]
    fn nan_comparison_is_false_not_panic() {
        let registry = DefaultIndicatorRegistry::new();
        let values = eval_formula("close[1] > 0", &bars(&[100.0]), &registry).unwrap();
        assert_eq!(values, vec![0.0]);
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let registry = DefaultIndicatorRegistry::new();
        assert!(eval_formula("bogus_column", &bars(&[1.0]), &registry).is_err());
    }

    #[test]
    fn trailing_garbage_after_expression_is_an_error() {
        let registry = DefaultIndicatorRegistry::new();
        assert!(eval_formula("1 + 1 2", &bars(&[1.0]), &registry).is_err());
    }

    #[test]
    fn indicator_call_dispatches_through_registry() {
        let registry = DefaultIndicatorRegistry::new();
        let closes: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let values = eval_formula("SMA(5)", &bars(&closes), &registry).unwrap();
        // SMA(5) of a straight ramp at the last bar is the average of the
        // last five values: 16..20.
        assert!((values.last().unwrap() - 18.0).abs() < 1e-9);
    }

    #[test]
    fn eval_formula_bool_treats_nonzero_as_true() {
        let registry = DefaultIndicatorRegistry::new();
        let values = eval_formula_bool("close - 100", &bars(&[100.0, 105.0]), &registry).unwrap();
        assert_eq!(values, vec![false, true]);
    }
}
