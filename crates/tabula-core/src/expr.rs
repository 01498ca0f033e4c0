//! Row-label templates and computed-field expressions.
//!
//! Two surface forms share one small AST:
//! - templates: `"{{FirstName}} {{LastName}}"`, literal text with field
//!   placeholders;
//! - `concat(...)`: `concat(FirstName, " ", {{LastName}})`, where each
//!   argument is a quoted literal, a bare field name or a placeholder. Any
//!   other argument evaluates to null and contributes nothing.
//!
//! Both are parsed once and evaluated against a canonical value map, so
//! braces or quotes inside user data are never re-interpreted.

use crate::types::value_ci;
use crate::value::Values;

/// One piece of a parsed expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Field(String),
    Null,
}

/// A parsed template or `concat(...)` expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expr {
    segments: Vec<Segment>,
}

impl Expr {
    /// Parse either surface form. Parsing never fails.
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim();
        if let Some(args) = concat_args(trimmed) {
            return Self {
                segments: parse_concat_args(args),
            };
        }
        Self {
            segments: parse_template(source),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Field names referenced by the expression, in order of appearance.
    pub fn field_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Field(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Substitute values; missing fields and null segments render as nothing.
    pub fn render(&self, values: &Values) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    if let Some(value) = value_ci(values, name) {
                        out.push_str(&value.to_string());
                    }
                }
                Segment::Null => {}
            }
        }
        out
    }

    /// Render and discard a blank result.
    pub fn evaluate(&self, values: &Values) -> Option<String> {
        let rendered = self.render(values);
        if rendered.trim().is_empty() {
            None
        } else {
            Some(rendered)
        }
    }
}

fn concat_args(source: &str) -> Option<&str> {
    let head = source.get(..7)?;
    if !head.eq_ignore_ascii_case("concat(") || !source.ends_with(')') {
        return None;
    }
    Some(&source[7..source.len() - 1])
}

fn parse_template(source: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let name = after[..end].trim();
        if name.is_empty() {
            push_literal(&mut segments, &rest[..start + 2 + end + 2]);
        } else {
            push_literal(&mut segments, &rest[..start]);
            segments.push(Segment::Field(name.to_string()));
        }
        rest = &after[end + 2..];
    }
    push_literal(&mut segments, rest);
    segments
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Segment::Literal(prev)) = segments.last_mut() {
        prev.push_str(text);
    } else {
        segments.push(Segment::Literal(text.to_string()));
    }
}

fn is_identifier(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn parse_concat_args(args: &str) -> Vec<Segment> {
    let chars: Vec<char> = args.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let segment = match chars[i] {
            quote @ ('"' | '\'') => {
                i += 1;
                let mut literal = String::new();
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            literal.push(chars[i + 1]);
                            i += 2;
                        }
                        c if c == quote => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        c => {
                            literal.push(c);
                            i += 1;
                        }
                    }
                }
                if closed {
                    Segment::Literal(literal)
                } else {
                    Segment::Null
                }
            }
            _ => {
                let start = i;
                while i < chars.len() && chars[i] != ',' {
                    i += 1;
                }
                let token: String = chars[start..i].iter().collect();
                let token = token.trim();
                if let Some(inner) = token
                    .strip_prefix("{{")
                    .and_then(|t| t.strip_suffix("}}"))
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                {
                    Segment::Field(inner.to_string())
                } else if is_identifier(token) {
                    Segment::Field(token.to_string())
                } else {
                    Segment::Null
                }
            }
        };
        segments.push(segment);

        // Skip anything up to and including the next separator.
        while i < chars.len() && chars[i] != ',' {
            i += 1;
        }
        i += 1;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CanonicalValue;

    fn values(pairs: &[(&str, CanonicalValue)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_template_substitution() {
        let expr = Expr::parse("{{First}} {{Last}}");
        let v = values(&[
            ("First", CanonicalValue::Text("Ada".into())),
            ("Last", CanonicalValue::Text("Lovelace".into())),
        ]);
        assert_eq!(expr.evaluate(&v).as_deref(), Some("Ada Lovelace"));
        assert_eq!(expr.field_names(), vec!["First", "Last"]);
    }

    #[test]
    fn test_template_case_insensitive_fields() {
        let expr = Expr::parse("#{{ age }}");
        let v = values(&[("Age", CanonicalValue::Number(36))]);
        assert_eq!(expr.render(&v), "#36");
    }

    #[test]
    fn test_template_missing_field_renders_empty() {
        let expr = Expr::parse("{{Missing}}");
        assert_eq!(expr.evaluate(&Values::new()), None);
    }

    #[test]
    fn test_template_unclosed_and_empty_braces_are_literal() {
        let expr = Expr::parse("a {{}} b {{oops");
        assert_eq!(expr.render(&Values::new()), "a {{}} b {{oops");
        assert!(expr.field_names().is_empty());
    }

    #[test]
    fn test_braces_in_values_are_not_reinterpreted() {
        let expr = Expr::parse("{{Name}}");
        let v = values(&[("Name", CanonicalValue::Text("{{Other}}".into()))]);
        assert_eq!(expr.render(&v), "{{Other}}");
    }

    #[test]
    fn test_concat_literals_and_fields() {
        let expr = Expr::parse(r#"concat(First, " ", {{Last}})"#);
        assert_eq!(
            expr.segments(),
            &[
                Segment::Field("First".into()),
                Segment::Literal(" ".into()),
                Segment::Field("Last".into()),
            ]
        );
        let v = values(&[
            ("First", CanonicalValue::Text("Grace".into())),
            ("Last", CanonicalValue::Text("Hopper".into())),
        ]);
        assert_eq!(expr.evaluate(&v).as_deref(), Some("Grace Hopper"));
    }

    #[test]
    fn test_concat_escapes_and_commas_in_quotes() {
        let expr = Expr::parse(r#"CONCAT('a, b', "say \"hi\"")"#);
        assert_eq!(expr.render(&Values::new()), "a, bsay \"hi\"");
    }

    #[test]
    fn test_concat_unrecognized_token_is_null() {
        let expr = Expr::parse("concat(Name, 1 + 2, \"!\")");
        assert_eq!(expr.segments()[1], Segment::Null);
        let v = values(&[("Name", CanonicalValue::Text("Ada".into()))]);
        assert_eq!(expr.render(&v), "Ada!");
    }

    #[test]
    fn test_concat_unterminated_quote_is_null() {
        let expr = Expr::parse("concat(Name, \"oops)");
        let v = values(&[("Name", CanonicalValue::Text("Ada".into()))]);
        assert_eq!(expr.render(&v), "Ada");
    }
}
