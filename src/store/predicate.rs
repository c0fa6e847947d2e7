//! Row predicates over column names.
//!
//! Predicates have a canonical textual form (the `Display` impl) which parses
//! back to the same tree. The filter compiler emits strings in this form and
//! `TableView::filter` parses them, so the string doubles as a cache key.
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | "(" expr ")" | cmp
//! cmp     := ident ( op literal
//!                  | ["not"] "in" "(" literal ("," literal)* ")"
//!                  | ["not"] "between" literal "and" literal
//!                  | "is" ["not"] "null" )
//! ident   := bare_name | "double quoted name"
//! literal := number | 'single quoted' | true | false | null
//! ```

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use super::StorageError;
use super::column::{Column, ColumnType, Value, days_from_date};
use super::table::TableView;

const KEYWORDS: &[&str] = &["and", "or", "not", "in", "between", "is", "null", "true", "false"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

/// Parsed predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        column: String,
        op: CmpOp,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
        negated: bool,
    },
    IsNull {
        column: String,
        negated: bool,
    },
}

impl Predicate {
    pub fn compare(column: &str, op: CmpOp, value: Value) -> Self {
        Self::Compare {
            column: column.to_string(),
            op,
            value,
        }
    }

    pub fn is_in(column: &str, values: Vec<Value>) -> Self {
        Self::In {
            column: column.to_string(),
            values,
            negated: false,
        }
    }

    pub fn not_in(column: &str, values: Vec<Value>) -> Self {
        Self::In {
            column: column.to_string(),
            values,
            negated: true,
        }
    }

    pub fn between(column: &str, low: Value, high: Value) -> Self {
        Self::Between {
            column: column.to_string(),
            low,
            high,
            negated: false,
        }
    }

    pub fn is_null(column: &str) -> Self {
        Self::IsNull {
            column: column.to_string(),
            negated: false,
        }
    }

    /// Conjunction of `parts`; a single part is returned as-is.
    pub fn all(mut parts: Vec<Predicate>) -> Option<Self> {
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Self::And(parts)),
        }
    }

    pub fn any(mut parts: Vec<Predicate>) -> Option<Self> {
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Self::Or(parts)),
        }
    }

    pub fn parse(input: &str) -> Result<Self, StorageError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let pred = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(StorageError::Predicate(format!(
                "unexpected trailing input at token {} in `{input}`",
                parser.pos
            )));
        }
        Ok(pred)
    }

    /// Column names referenced by the predicate, in first-use order.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::And(parts) | Self::Or(parts) => {
                for p in parts {
                    p.collect_columns(out);
                }
            }
            Self::Not(inner) => inner.collect_columns(out),
            Self::Compare { column, .. }
            | Self::In { column, .. }
            | Self::Between { column, .. }
            | Self::IsNull { column, .. } => {
                if !out.contains(&column.as_str()) {
                    out.push(column);
                }
            }
        }
    }

    /// Evaluate against every row of `table`.
    pub fn evaluate(&self, table: &TableView) -> Result<Vec<bool>, StorageError> {
        let n = table.num_rows();
        match self {
            Self::And(parts) => {
                let mut mask = vec![true; n];
                for p in parts {
                    let m = p.evaluate(table)?;
                    for (a, b) in mask.iter_mut().zip(m) {
                        *a &= b;
                    }
                }
                Ok(mask)
            }
            Self::Or(parts) => {
                let mut mask = vec![false; n];
                for p in parts {
                    let m = p.evaluate(table)?;
                    for (a, b) in mask.iter_mut().zip(m) {
                        *a |= b;
                    }
                }
                Ok(mask)
            }
            Self::Not(inner) => Ok(inner.evaluate(table)?.into_iter().map(|b| !b).collect()),
            Self::Compare { column, op, value } => {
                let col = table.column(column)?;
                let lit = coerce_literal(col, value)?;
                if lit.is_null() {
                    return Ok(vec![false; n]);
                }
                Ok((0..n)
                    .map(|i| col.cmp_at(i, &lit).is_some_and(|ord| op.holds(ord)))
                    .collect())
            }
            Self::In {
                column,
                values,
                negated,
            } => {
                let col = table.column(column)?;
                let mut set = values
                    .iter()
                    .map(|v| coerce_literal(col, v))
                    .collect::<Result<Vec<_>, _>>()?;
                set.retain(|v| !v.is_null());
                set.sort();
                set.dedup();
                Ok((0..n)
                    .map(|i| {
                        if col.is_null(i) {
                            return false;
                        }
                        let found = set
                            .binary_search_by(|probe| {
                                col.cmp_at(i, probe).map_or(Ordering::Less, Ordering::reverse)
                            })
                            .is_ok();
                        found != *negated
                    })
                    .collect())
            }
            Self::Between {
                column,
                low,
                high,
                negated,
            } => {
                let col = table.column(column)?;
                let low = coerce_literal(col, low)?;
                let high = coerce_literal(col, high)?;
                if low.is_null() || high.is_null() {
                    return Ok(vec![false; n]);
                }
                Ok((0..n)
                    .map(|i| {
                        let (Some(lo), Some(hi)) = (col.cmp_at(i, &low), col.cmp_at(i, &high))
                        else {
                            return false;
                        };
                        let inside = lo != Ordering::Less && hi != Ordering::Greater;
                        inside != *negated
                    })
                    .collect())
            }
            Self::IsNull { column, negated } => {
                let col = table.column(column)?;
                Ok((0..n).map(|i| col.is_null(i) != *negated).collect())
            }
        }
    }
}

/// Convert a literal to the column's value domain so comparisons need no per-row coercion.
fn coerce_literal(col: &Column, value: &Value) -> Result<Value, StorageError> {
    let coerced = match (col.column_type(), value) {
        (_, Value::Null) => Value::Null,
        (ColumnType::Date, Value::Str(s)) => Value::Date(days_from_date(parse_date(s)?)),
        (ColumnType::Timestamp, Value::Str(s)) => Value::Timestamp(parse_instant(s)?),
        (ColumnType::Utf8, Value::Int(_) | Value::Float(_) | Value::Boolean(_)) => {
            Value::Str(value.to_string())
        }
        (ColumnType::Int64 | ColumnType::Float64, Value::Str(s)) => {
            if let Ok(x) = s.parse::<i64>() {
                Value::Int(x)
            } else if let Ok(x) = s.parse::<f64>() {
                Value::Float(x)
            } else {
                return Err(StorageError::Predicate(format!(
                    "cannot compare numeric column with '{s}'"
                )));
            }
        }
        (_, v) => v.clone(),
    };
    Ok(coerced)
}

fn parse_date(s: &str) -> Result<NaiveDate, StorageError> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d);
    }
    parse_instant(s)
        .ok()
        .and_then(DateTime::from_timestamp_micros)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| StorageError::Predicate(format!("invalid date literal '{s}'")))
}

/// Instant in microseconds. Naive datetimes and bare dates are read as UTC.
fn parse_instant(s: &str) -> Result<i64, StorageError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_micros());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc().timestamp_micros());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_micros())
        .ok_or_else(|| StorageError::Predicate(format!("invalid timestamp literal '{s}'")))
}

// ---------------------------------------------------------------------------
// Rendering

fn write_ident(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    let bare = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !KEYWORDS.contains(&name.to_ascii_lowercase().as_str());
    if bare {
        f.write_str(name)
    } else {
        write!(f, "\"{}\"", name.replace('"', "\"\""))
    }
}

fn write_literal(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Boolean(b) => write!(f, "{b}"),
        Value::Int(x) => write!(f, "{x}"),
        // Debug keeps a fractional part so the literal re-parses as a float
        Value::Float(x) if x.is_finite() => write!(f, "{x:?}"),
        Value::Float(_) => f.write_str("null"),
        Value::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
        Value::Date(_) | Value::Timestamp(_) => write!(f, "'{value}'"),
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(parts) | Self::Or(parts) => {
                let sep = if matches!(self, Self::And(_)) { " and " } else { " or " };
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    if matches!(p, Self::And(_) | Self::Or(_)) {
                        write!(f, "({p})")?;
                    } else {
                        write!(f, "{p}")?;
                    }
                }
                Ok(())
            }
            Self::Not(inner) => write!(f, "not ({inner})"),
            Self::Compare { column, op, value } => {
                write_ident(f, column)?;
                write!(f, " {} ", op.symbol())?;
                write_literal(f, value)
            }
            Self::In {
                column,
                values,
                negated,
            } => {
                write_ident(f, column)?;
                f.write_str(if *negated { " not in (" } else { " in (" })?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_literal(f, v)?;
                }
                f.write_str(")")
            }
            Self::Between {
                column,
                low,
                high,
                negated,
            } => {
                write_ident(f, column)?;
                f.write_str(if *negated { " not between " } else { " between " })?;
                write_literal(f, low)?;
                f.write_str(" and ")?;
                write_literal(f, high)
            }
            Self::IsNull { column, negated } => {
                write_ident(f, column)?;
                f.write_str(if *negated { " is not null" } else { " is null" })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lexing and parsing

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Keyword(&'static str),
    Literal(Value),
    Op(CmpOp),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, StorageError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
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
            '\'' | '"' => {
                let (text, next) = read_quoted(&chars, i)?;
                tokens.push(if c == '\'' {
                    Token::Literal(Value::Str(text))
                } else {
                    Token::Ident(text)
                });
                i = next;
            }
            '=' | '!' | '<' | '>' => {
                let two = chars.get(i + 1) == Some(&'=');
                let op = match (c, two) {
                    ('=', true) => CmpOp::Eq,
                    ('=', false) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    _ => {
                        return Err(StorageError::Predicate(format!(
                            "unexpected '{c}' at offset {i}"
                        )));
                    }
                };
                tokens.push(Token::Op(op));
                i += if two { 2 } else { 1 };
            }
            c if c.is_ascii_digit()
                || ((c == '-' || c == '.')
                    && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() {
                    let d = chars[i];
                    let exp_sign = (d == '-' || d == '+') && matches!(chars[i - 1], 'e' | 'E');
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exp_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = if let Ok(x) = text.parse::<i64>() {
                    Value::Int(x)
                } else {
                    text.parse::<f64>().map(Value::Float).map_err(|_| {
                        StorageError::Predicate(format!("invalid number '{text}'"))
                    })?
                };
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let lower = word.to_ascii_lowercase();
                let token = match lower.as_str() {
                    "true" => Token::Literal(Value::Boolean(true)),
                    "false" => Token::Literal(Value::Boolean(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => match KEYWORDS.iter().find(|k| **k == lower) {
                        Some(k) => Token::Keyword(*k),
                        None => Token::Ident(word),
                    },
                };
                tokens.push(token);
            }
            other => {
                return Err(StorageError::Predicate(format!(
                    "unexpected '{other}' at offset {i}"
                )));
            }
        }
    }
    Ok(tokens)
}

/// Read a quoted run starting at `start`; doubled quotes escape themselves.
fn read_quoted(chars: &[char], start: usize) -> Result<(String, usize), StorageError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                out.push(quote);
                i += 2;
                continue;
            }
            return Ok((out, i + 1));
        }
        out.push(chars[i]);
        i += 1;
    }
    Err(StorageError::Predicate(format!(
        "unterminated quote starting at offset {start}"
    )))
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
        self.pos += 1;
        t
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Keyword(k)) if *k == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, want: &Token, what: &str) -> Result<(), StorageError> {
        match self.next() {
            Some(ref t) if t == want => Ok(()),
            other => Err(StorageError::Predicate(format!("expected {what}, found {other:?}"))),
        }
    }

    fn expr(&mut self) -> Result<Predicate, StorageError> {
        let mut parts = vec![self.and()?];
        while self.eat_keyword("or") {
            parts.push(self.and()?);
        }
        Ok(Predicate::any(parts).unwrap_or(Predicate::And(Vec::new())))
    }

    fn and(&mut self) -> Result<Predicate, StorageError> {
        let mut parts = vec![self.unary()?];
        while self.eat_keyword("and") {
            parts.push(self.unary()?);
        }
        Ok(Predicate::all(parts).unwrap_or(Predicate::And(Vec::new())))
    }

    fn unary(&mut self) -> Result<Predicate, StorageError> {
        if self.eat_keyword("not") {
            return Ok(Predicate::Not(Box::new(self.unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(&Token::RParen, "')'")?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn literal(&mut self) -> Result<Value, StorageError> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(v),
            other => Err(StorageError::Predicate(format!("expected literal, found {other:?}"))),
        }
    }

    fn comparison(&mut self) -> Result<Predicate, StorageError> {
        let column = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(StorageError::Predicate(format!(
                    "expected column name, found {other:?}"
                )));
            }
        };

        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let value = self.literal()?;
            return Ok(Predicate::Compare { column, op, value });
        }

        if self.eat_keyword("is") {
            let negated = self.eat_keyword("not");
            if !matches!(self.next(), Some(Token::Literal(Value::Null))) {
                return Err(StorageError::Predicate("expected null after 'is'".into()));
            }
            return Ok(Predicate::IsNull { column, negated });
        }

        let negated = self.eat_keyword("not");
        if self.eat_keyword("in") {
            self.expect(&Token::LParen, "'(' after 'in'")?;
            let mut values = Vec::new();
            if self.peek() != Some(&Token::RParen) {
                values.push(self.literal()?);
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    values.push(self.literal()?);
                }
            }
            self.expect(&Token::RParen, "')' closing 'in' list")?;
            return Ok(Predicate::In {
                column,
                values,
                negated,
            });
        }
        if self.eat_keyword("between") {
            let low = self.literal()?;
            if !self.eat_keyword("and") {
                return Err(StorageError::Predicate("expected 'and' in 'between'".into()));
            }
            let high = self.literal()?;
            return Ok(Predicate::Between {
                column,
                low,
                high,
                negated,
            });
        }

        Err(StorageError::Predicate(format!(
            "expected operator after column `{column}`"
        )))
    }
}
