//! Where-clause guard.
//!
//! The filter string is opaque to the coordinator, but a truncation tool must
//! never run an unbounded purge by accident. This module rejects empty and
//! trivially-true filters and extracts the column names a filter mentions so
//! they can be checked against the table's indexes.

use crate::error::{ConfigError, Result};
use crate::schema::IndexSchema;
use std::collections::BTreeSet;

const KEYWORDS: &[&str] = &[
    "AND", "OR", "NOT", "NULL", "IS", "IN", "LIKE", "BETWEEN", "TRUE", "FALSE", "CAST", "AS",
    "DATE", "TIMESTAMP", "INTERVAL", "EXISTS", "SELECT", "FROM", "WHERE", "CASE", "WHEN", "THEN",
    "ELSE", "END", "ESCAPE", "ANY", "ALL", "SOME", "YEAR", "MONTH", "WEEK", "DAY", "HOUR",
    "MINUTE", "SECOND",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Symbol(String),
}

/// Reject filters that would delete every row.
pub fn validate_filter(where_clause: &str) -> Result<()> {
    let tokens = tokenize(where_clause);
    if tokens.is_empty() {
        return Err(ConfigError::EmptyFilter.into());
    }

    let tokens = strip_wrapping_parens(&tokens);
    if tokens.is_empty() {
        return Err(ConfigError::EmptyFilter.into());
    }

    if split_top_level_or(tokens).iter().any(|d| is_tautology(d)) {
        return Err(ConfigError::UnboundedFilter {
            filter: where_clause.trim().to_string(),
        }
        .into());
    }

    Ok(())
}

/// Column names mentioned by the filter, upper-cased, in sorted order.
pub fn referenced_columns(where_clause: &str) -> BTreeSet<String> {
    let tokens = tokenize(where_clause);
    let mut columns = BTreeSet::new();
    for (i, token) in tokens.iter().enumerate() {
        if let Token::Ident(name) = token {
            let upper = name.to_ascii_uppercase();
            let is_call = matches!(tokens.get(i + 1), Some(Token::Symbol(s)) if s == "(");
            if !is_call && !KEYWORDS.contains(&upper.as_str()) {
                columns.insert(upper);
            }
        }
    }
    columns
}

/// Whether some index on `table` leads with a column the filter mentions.
pub fn is_filter_indexed(table: &str, indexes: &[IndexSchema], columns: &BTreeSet<String>) -> bool {
    indexes
        .iter()
        .filter(|index| index.table == table)
        .filter_map(|index| index.columns.first())
        .any(|leading| columns.contains(&leading.to_ascii_uppercase()))
}

fn tokenize(input: &str) -> Vec<Token> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' || c == '"' {
            let quote = c;
            let mut literal = String::new();
            i += 1;
            while i < chars.len() && chars[i] != quote {
                literal.push(chars[i]);
                i += 1;
            }
            i += 1;
            tokens.push(Token::Str(literal));
        } else if c == '`' {
            let mut ident = String::new();
            i += 1;
            while i < chars.len() && chars[i] != '`' {
                ident.push(chars[i]);
                i += 1;
            }
            i += 1;
            tokens.push(Token::Ident(ident));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
            if matches!(two.as_str(), "<=" | ">=" | "<>" | "!=" | "==") {
                tokens.push(Token::Symbol(two));
                i += 2;
            } else {
                tokens.push(Token::Symbol(c.to_string()));
                i += 1;
            }
        }
    }

    tokens
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Ident(name) if name.eq_ignore_ascii_case(keyword))
}

fn strip_wrapping_parens(mut tokens: &[Token]) -> &[Token] {
    loop {
        let wrapped = tokens.len() >= 2
            && tokens.first() == Some(&Token::Symbol("(".into()))
            && tokens.last() == Some(&Token::Symbol(")".into()))
            && closes_at_end(tokens);
        if !wrapped {
            return tokens;
        }
        tokens = &tokens[1..tokens.len() - 1];
    }
}

/// The opening paren at index 0 is matched by the final token.
fn closes_at_end(tokens: &[Token]) -> bool {
    let mut depth = 0i32;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Symbol(s) if s == "(" => depth += 1,
            Token::Symbol(s) if s == ")" => {
                depth -= 1;
                if depth == 0 && i != tokens.len() - 1 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn split_top_level_or(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Symbol(s) if s == "(" => depth += 1,
            Token::Symbol(s) if s == ")" => depth -= 1,
            _ if depth == 0 && is_keyword(token, "OR") => {
                parts.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts
}

fn is_tautology(tokens: &[Token]) -> bool {
    let tokens = strip_wrapping_parens(tokens);
    match tokens {
        [] => false,
        [single] => is_keyword(single, "TRUE") || is_truthy_number(single),
        [not, operand] if is_keyword(not, "NOT") => is_keyword(operand, "FALSE"),
        [lhs, Token::Symbol(op), rhs] if matches!(op.as_str(), "=" | "==" | ">=" | "<=") => {
            is_literal(lhs) && lhs == rhs
        }
        _ => false,
    }
}

fn is_literal(token: &Token) -> bool {
    matches!(token, Token::Number(_) | Token::Str(_))
}

fn is_truthy_number(token: &Token) -> bool {
    matches!(token, Token::Number(n) if n.parse::<f64>().map(|v| v != 0.0).unwrap_or(false))
}
