// Template Lexer
// Splits strings into literal text and `${path}` references

use crate::address::{Address, AddressError};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unclosed '${{' at offset {offset} in '{input}'")]
    Unclosed { input: String, offset: usize },

    #[error("invalid reference '{reference}': {source}")]
    InvalidReference {
        reference: String,
        #[source]
        source: AddressError,
    },
}

/// A piece of a template string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    /// Literal text copied verbatim
    Text(String),
    /// A `${path}` interpolation
    Reference(Address),
}

/// Split `input` into text and reference parts.
///
/// Adjacent text is merged; a string without any `${` yields a single
/// `Text` part (or nothing for the empty string).
pub fn tokenize(input: &str) -> Result<Vec<TemplatePart>, LexError> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut rest = input;
    let mut consumed = 0;

    while let Some(start) = rest.find("${") {
        text.push_str(&rest[..start]);

        let body_start = start + 2;
        let Some(len) = rest[body_start..].find('}') else {
            return Err(LexError::Unclosed {
                input: input.to_string(),
                offset: consumed + start,
            });
        };

        let raw = rest[body_start..body_start + len].trim();
        let address: Address = raw.parse().map_err(|source| LexError::InvalidReference {
            reference: raw.to_string(),
            source,
        })?;

        if !text.is_empty() {
            parts.push(TemplatePart::Text(std::mem::take(&mut text)));
        }
        parts.push(TemplatePart::Reference(address));

        let advance = body_start + len + 1;
        consumed += advance;
        rest = &rest[advance..];
    }

    text.push_str(rest);
    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }

    Ok(parts)
}
