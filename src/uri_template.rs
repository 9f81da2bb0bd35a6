//! RFC 6570 URI template subset used for resource matching.
//!
//! Supported expressions:
//!
//! - `{var}` matches one path segment (`[^/]+`)
//! - `{+var}` matches greedily across segments (`.+`)
//! - `{/var*}` matches a `/`-separated sequence, captured as an ordered
//!   list of segments
//!
//! Templates compile to an anchored regex once, at registration time.
//! Matching normalizes the URI scheme case on both sides.

use regex::Regex;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// A captured template variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateValue {
    /// Single value from `{var}` or `{+var}`.
    One(String),
    /// Ordered path segments from `{/var*}`.
    Many(Vec<String>),
}

impl TemplateValue {
    /// The single value, if this capture is not a sequence.
    pub fn as_one(&self) -> Option<&str> {
        match self {
            Self::One(s) => Some(s),
            Self::Many(_) => None,
        }
    }

    /// The segment sequence, if this capture came from an explode operator.
    pub fn as_many(&self) -> Option<&[String]> {
        match self {
            Self::One(_) => None,
            Self::Many(segments) => Some(segments),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarKind {
    Segment,
    Reserved,
    PathExplode,
}

#[derive(Debug, Clone)]
struct VarSpec {
    name: String,
    kind: VarKind,
}

/// A compiled URI template.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    raw: String,
    pattern: Regex,
    vars: Vec<VarSpec>,
    literal_prefix: String,
}

fn valid_var_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Lowercase the scheme part of a URI or template, leaving the rest as-is.
fn normalize_scheme(uri: &str) -> String {
    match uri.find(':') {
        Some(pos) => {
            let (scheme, rest) = uri.split_at(pos);
            format!("{}{}", scheme.to_ascii_lowercase(), rest)
        },
        None => uri.to_string(),
    }
}

impl UriTemplate {
    /// Compile a template string.
    ///
    /// Fails with invalid-params on unbalanced braces, empty or malformed
    /// variable names, and unsupported operators.
    pub fn parse(template: &str) -> Result<Self> {
        let mut pattern = String::from("^");
        let mut vars = Vec::new();
        let mut literal_prefix = String::new();
        let mut saw_expression = false;

        let mut rest = template;
        while let Some(open) = rest.find('{') {
            let (literal, tail) = rest.split_at(open);
            pattern.push_str(&regex::escape(literal));
            if !saw_expression {
                literal_prefix.push_str(literal);
            }

            let close = tail.find('}').ok_or_else(|| {
                Error::invalid_params(format!("unbalanced braces in URI template: {template}"))
            })?;
            let expr = &tail[1..close];
            rest = &tail[close + 1..];
            saw_expression = true;

            let (kind, name) = if let Some(name) = expr.strip_prefix('+') {
                (VarKind::Reserved, name)
            } else if let Some(inner) = expr.strip_prefix('/') {
                let name = inner.strip_suffix('*').ok_or_else(|| {
                    Error::invalid_params(format!(
                        "unsupported operator in URI template expression: {{{expr}}}"
                    ))
                })?;
                (VarKind::PathExplode, name)
            } else {
                (VarKind::Segment, expr)
            };

            if !valid_var_name(name) {
                return Err(Error::invalid_params(format!(
                    "invalid variable name in URI template: {{{expr}}}"
                )));
            }

            match kind {
                VarKind::Segment => pattern.push_str("([^/]+)"),
                VarKind::Reserved => pattern.push_str("(.+)"),
                VarKind::PathExplode => pattern.push_str("((?:/[^/]+)*)"),
            }
            vars.push(VarSpec {
                name: name.to_string(),
                kind,
            });
        }
        pattern.push_str(&regex::escape(rest));
        if !saw_expression {
            literal_prefix.push_str(rest);
        }
        pattern.push('$');

        let compiled = Regex::new(&normalize_scheme(&pattern))
            .map_err(|e| Error::invalid_params(format!("invalid URI template: {e}")))?;

        Ok(Self {
            raw: template.to_string(),
            pattern: compiled,
            vars,
            literal_prefix: normalize_scheme(&literal_prefix),
        })
    }

    /// The template source text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The literal text before the first expression, scheme-normalized.
    /// Longer prefixes win when several templates match one URI.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    /// Match a URI, returning captured variables or `None`.
    pub fn match_uri(&self, uri: &str) -> Option<HashMap<String, TemplateValue>> {
        let normalized = normalize_scheme(uri);
        let captures = self.pattern.captures(&normalized)?;

        let mut values = HashMap::with_capacity(self.vars.len());
        for (index, spec) in self.vars.iter().enumerate() {
            let raw = captures.get(index + 1)?.as_str();
            let value = match spec.kind {
                VarKind::Segment | VarKind::Reserved => TemplateValue::One(decode(raw)),
                VarKind::PathExplode => TemplateValue::Many(
                    raw.split('/')
                        .filter(|segment| !segment.is_empty())
                        .map(decode)
                        .collect(),
                ),
            };
            values.insert(spec.name.clone(), value);
        }
        Some(values)
    }
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}
