use std::collections::HashMap;

use crate::http::parser::{ParseError, parse_query};

pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Decodes an `application/x-www-form-urlencoded` body into fields.
pub fn parse_form(body: &[u8]) -> Result<HashMap<String, String>, ParseError> {
    let text = String::from_utf8_lossy(body);
    parse_query(text.trim_end_matches(['\r', '\n']))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fields() {
        let fields = parse_form(b"a=1&b=two+words").unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["a"], "1");
        assert_eq!(fields["b"], "two words");
    }

    #[test]
    fn trailing_newline_is_ignored() {
        let fields = parse_form(b"name=x%26y\r\n").unwrap();
        assert_eq!(fields["name"], "x&y");
    }

    #[test]
    fn bad_escape_is_an_error() {
        assert_eq!(parse_form(b"a=%g1"), Err(ParseError::MalformedEscape));
    }
}
