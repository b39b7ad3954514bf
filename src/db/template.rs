//! SQL statement templating with MySQL quoting rules.
//!
//! Statements are assembled client-side: `%n` substitutes a backtick-quoted
//! identifier, `%?` substitutes a quoted value. All values are interpolated
//! before the statement reaches the wire, so a built string is always a
//! complete, executable statement.

use serde::{Deserialize, Serialize};

/// A single substitution argument for [`build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Param {
    /// An identifier (schema, table, or column name), quoted with backticks.
    Ident(String),
    /// A string value, single-quoted and escaped.
    Str(String),
    /// A signed integer value.
    Int(i64),
    /// An unsigned integer value.
    UInt(u64),
}

impl From<&str> for Param {
    fn from(s: &str) -> Self {
        Param::Str(s.to_string())
    }
}

impl From<String> for Param {
    fn from(s: String) -> Self {
        Param::Str(s)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<u64> for Param {
    fn from(v: u64) -> Self {
        Param::UInt(v)
    }
}

impl From<u32> for Param {
    fn from(v: u32) -> Self {
        Param::UInt(u64::from(v))
    }
}

/// Shorthand for [`Param::Ident`].
pub fn ident(s: impl Into<String>) -> Param {
    Param::Ident(s.into())
}

/// Errors raised while assembling a statement from a template.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    /// More `%n`/`%?` directives than arguments.
    #[error("not enough arguments for template (needed more than {0})")]
    NotEnoughArgs(usize),
    /// Fewer directives than arguments.
    #[error("too many arguments for template ({extra} unused)")]
    TooManyArgs { extra: usize },
    /// A `%n` directive was given a non-identifier argument, or vice versa.
    #[error("argument {index} does not match directive %{directive}")]
    Mismatch { index: usize, directive: char },
    /// An unknown `%x` directive appeared in the template.
    #[error("unknown directive %{0} in template")]
    UnknownDirective(char),
    /// A trailing `%` with no directive character.
    #[error("dangling % at end of template")]
    Dangling,
    /// An identifier contained a NUL byte.
    #[error("identifier contains a NUL byte")]
    NulInIdent,
}

/// Quote an identifier with backticks, doubling any embedded backticks.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for c in name.chars() {
        if c == '`' {
            out.push('`');
        }
        out.push(c);
    }
    out.push('`');
    out
}

/// Quote a string value with single quotes, escaping per MySQL rules.
pub fn quote_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{1a}' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn render_value(p: &Param) -> String {
    match p {
        Param::Ident(name) => quote_ident(name),
        Param::Str(s) => quote_str(s),
        Param::Int(v) => v.to_string(),
        Param::UInt(v) => v.to_string(),
    }
}

/// Assemble a statement from `template`, substituting `%n` with identifiers
/// and `%?` with values from `params` in order. `%%` emits a literal `%`.
pub fn build(template: &str, params: &[Param]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + params.len() * 8);
    let mut args = params.iter().enumerate();
    let mut consumed = 0usize;
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('n') => {
                let (index, p) = args.next().ok_or(TemplateError::NotEnoughArgs(consumed))?;
                consumed += 1;
                match p {
                    Param::Ident(name) => {
                        if name.contains('\0') {
                            return Err(TemplateError::NulInIdent);
                        }
                        out.push_str(&quote_ident(name));
                    }
                    _ => return Err(TemplateError::Mismatch { index, directive: 'n' }),
                }
            }
            Some('?') => {
                let (index, p) = args.next().ok_or(TemplateError::NotEnoughArgs(consumed))?;
                consumed += 1;
                match p {
                    Param::Ident(_) => {
                        return Err(TemplateError::Mismatch { index, directive: '?' })
                    }
                    _ => out.push_str(&render_value(p)),
                }
            }
            Some(other) => return Err(TemplateError::UnknownDirective(other)),
            None => return Err(TemplateError::Dangling),
        }
    }
    let extra = params.len() - consumed;
    if extra > 0 {
        return Err(TemplateError::TooManyArgs { extra });
    }
    Ok(out)
}
