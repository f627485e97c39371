//! Equality-based label selector strings
//!
//! Parses the selector syntax users write in specs (`app=nginx`,
//! `tier!=cache`, `env in (prod, staging)`, `!legacy`) and evaluates it
//! against an object's label map. Set-based `in`/`notin` and bare
//! existence terms are supported; anything else is a parse error reported
//! at validation time.

use std::collections::BTreeMap;

/// A parsed label selector
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelQuery {
    terms: Vec<Term>,
}

#[derive(Clone, Debug, PartialEq)]
enum Term {
    Eq(String, String),
    NotEq(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    NotExists(String),
}

impl LabelQuery {
    /// A selector matching everything
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parse a selector string; an empty string matches everything.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::everything());
        }

        let mut terms = Vec::new();
        for raw in split_terms(s) {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err("empty selector term".to_string());
            }
            terms.push(parse_term(raw)?);
        }
        Ok(Self { terms })
    }

    /// Whether the label map satisfies every term
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|t| match t {
            Term::Eq(k, v) => labels.get(k) == Some(v),
            Term::NotEq(k, v) => labels.get(k) != Some(v),
            Term::In(k, vs) => labels.get(k).map(|v| vs.contains(v)).unwrap_or(false),
            Term::NotIn(k, vs) => labels.get(k).map(|v| !vs.contains(v)).unwrap_or(true),
            Term::Exists(k) => labels.contains_key(k),
            Term::NotExists(k) => !labels.contains_key(k),
        })
    }
}

// Split on commas that are not inside a parenthesized value set.
fn split_terms(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                cur.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            ',' if depth == 0 => {
                out.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    out.push(cur);
    out
}

fn parse_term(raw: &str) -> Result<Term, String> {
    if let Some((key, rest)) = split_op(raw, " notin ") {
        return Ok(Term::NotIn(key, parse_set(&rest)?));
    }
    if let Some((key, rest)) = split_op(raw, " in ") {
        return Ok(Term::In(key, parse_set(&rest)?));
    }
    if let Some((key, value)) = raw.split_once("!=") {
        return Ok(Term::NotEq(key.trim().to_string(), value.trim().to_string()));
    }
    if let Some((key, value)) = raw.split_once("==") {
        return Ok(Term::Eq(key.trim().to_string(), value.trim().to_string()));
    }
    if let Some((key, value)) = raw.split_once('=') {
        return Ok(Term::Eq(key.trim().to_string(), value.trim().to_string()));
    }
    if let Some(key) = raw.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            return Err("'!' must be followed by a label key".to_string());
        }
        return Ok(Term::NotExists(key.to_string()));
    }
    if raw.contains(|c: char| c.is_whitespace() || c == '(' || c == ')') {
        return Err(format!("cannot parse selector term {raw:?}"));
    }
    Ok(Term::Exists(raw.to_string()))
}

fn split_op(raw: &str, op: &str) -> Option<(String, String)> {
    raw.split_once(op)
        .map(|(k, r)| (k.trim().to_string(), r.trim().to_string()))
}

fn parse_set(rest: &str) -> Result<Vec<String>, String> {
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| format!("expected parenthesized value set, got {rest:?}"))?;
    let values: Vec<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Err("value set must not be empty".to_string());
    }
    Ok(values)
}
