//! Placeholder templates for profile parameters.
//!
//! A parameter like `http://${address}:9200/health` is parsed once into a
//! list of literal and placeholder segments and rendered against a target's
//! variables at load time. Rendering is pure: the same segments and
//! variables always produce the same string.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("unresolved placeholder ${{{0}}}")]
    Unresolved(String),
    #[error("placeholder ${{{0}}} resolved to an empty string")]
    Empty(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Split the input into literal and `${name}` placeholder segments.
    /// An unterminated `${` is kept as a literal.
    pub fn parse(input: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            match rest[start..].find('}') {
                Some(end) => {
                    literal.push_str(&rest[..start]);
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(rest[start + 2..start + end].to_string()));
                    rest = &rest[start + end + 1..];
                }
                None => break,
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    pub fn has_placeholders(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Placeholder(_)))
    }

    /// Substitute every placeholder from `vars`. An unknown name or an
    /// empty value is an error, not a silent fallback.
    pub fn render(&self, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value =
                        vars.get(name).ok_or_else(|| TemplateError::Unresolved(name.clone()))?;
                    if value.is_empty() {
                        return Err(TemplateError::Empty(name.clone()));
                    }
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => write!(f, "{text}")?,
                Segment::Placeholder(name) => write!(f, "${{{name}}}")?,
            }
        }
        Ok(())
    }
}

/// Render `input` against `vars` in one step.
pub fn render(input: &str, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
    Template::parse(input).render(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn renders_placeholders_in_context() {
        let vars = vars(&[("address", "10.0.0.5"), ("api_port", "9200")]);
        let out = render("http://${address}:${api_port}/admin/v1/nodes", &vars).unwrap();
        assert_eq!(out, "http://10.0.0.5:9200/admin/v1/nodes");
    }

    #[test]
    fn literal_only_input_passes_through() {
        assert_eq!(render("https://example.com/health", &vars(&[])).unwrap(), "https://example.com/health");
    }

    #[test]
    fn rendering_is_deterministic() {
        let vars = vars(&[("address", "host-a")]);
        let template = Template::parse("ping ${address} now");
        assert_eq!(template.render(&vars).unwrap(), template.render(&vars).unwrap());
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = render("${address}", &vars(&[])).unwrap_err();
        assert_eq!(err, TemplateError::Unresolved("address".into()));
    }

    #[test]
    fn empty_value_is_an_error() {
        let err = render("${address}", &vars(&[("address", "")])).unwrap_err();
        assert_eq!(err, TemplateError::Empty("address".into()));
    }

    #[test]
    fn unterminated_placeholder_stays_literal() {
        let template = Template::parse("prefix-${address");
        assert!(!template.has_placeholders());
        assert_eq!(template.render(&vars(&[])).unwrap(), "prefix-${address");
    }

    #[test]
    fn display_round_trips_the_source() {
        let source = "http://${address}:8080/${path}";
        assert_eq!(Template::parse(source).to_string(), source);
    }
}
