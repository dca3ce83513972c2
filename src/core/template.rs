//! Bootstrap template rendering.
//!
//! Substitutes `${name}` placeholders from a variable map. `$${` is an escaped
//! literal `${`. Rendering is all-or-nothing: any unknown or malformed
//! placeholder fails the whole render.

use super::error::RenderError;
use super::types::AttrValue;
use base64::Engine;
use indexmap::IndexMap;
use regex::Regex;
use std::sync::OnceLock;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\$\{|\$\{([^}]*)\}")
            .expect("placeholder pattern is valid")
    })
}

/// Render `template`, substituting every placeholder from `vars`.
pub fn render(template: &str, vars: &IndexMap<String, AttrValue>) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder_pattern().captures_iter(template) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        out.push_str(&template[last..whole.start]);
        last = whole.end;

        let Some(name) = caps.get(1).map(|m| m.as_str().trim()) else {
            out.push_str("${");
            continue;
        };
        if !is_identifier(name) {
            return Err(RenderError::MalformedPlaceholder {
                text: template[whole].to_string(),
            });
        }
        let value = vars.get(name).ok_or_else(|| RenderError::MissingVariable {
            name: name.to_string(),
        })?;
        let text = value
            .render_scalar()
            .ok_or_else(|| RenderError::NonScalarVariable {
                name: name.to_string(),
            })?;
        out.push_str(&text);
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Placeholder names in first-appearance order, without duplicates.
/// Malformed names are returned as written so callers can report them.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder_pattern().captures_iter(template) {
        if let Some(name) = caps.get(1).map(|m| m.as_str().trim()) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Encode a rendered payload the way instance user data is shipped.
pub fn encode_user_data(rendered: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(rendered.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> IndexMap<String, AttrValue> {
        IndexMap::from([
            ("server_port".to_string(), AttrValue::Int(8080)),
            ("db_address".to_string(), AttrValue::from("10.0.0.5")),
            ("db_port".to_string(), AttrValue::Int(5432)),
        ])
    }

    #[test]
    fn test_template_render_all_vars() {
        let template = "port=${server_port} db=${db_address}:${db_port}";
        let out = render(template, &vars()).unwrap();
        assert_eq!(out, "port=8080 db=10.0.0.5:5432");
        assert!(!out.contains("${"));
    }

    #[test]
    fn test_template_render_multiline_script() {
        let template = "#!/bin/bash\necho \"${db_address}\" > index.html\nnohup busybox httpd -f -p ${server_port} &\n";
        let out = render(template, &vars()).unwrap();
        assert!(out.contains("echo \"10.0.0.5\""));
        assert!(out.contains("-p 8080 &"));
    }

    #[test]
    fn test_template_missing_variable() {
        let mut v = vars();
        v.shift_remove("db_port");
        let err = render("${server_port} ${db_port}", &v).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingVariable {
                name: "db_port".into()
            }
        );
    }

    #[test]
    fn test_template_non_scalar() {
        let mut v = vars();
        v.insert("subnets".to_string(), AttrValue::list(["a", "b"]));
        let err = render("${subnets}", &v).unwrap_err();
        assert!(matches!(err, RenderError::NonScalarVariable { .. }));
    }

    #[test]
    fn test_template_escape_and_whitespace() {
        let out = render("$${HOME} ${ server_port }", &vars()).unwrap();
        assert_eq!(out, "${HOME} 8080");
    }

    #[test]
    fn test_template_no_placeholders() {
        assert_eq!(render("plain text", &IndexMap::new()).unwrap(), "plain text");
    }

    #[test]
    fn test_template_deterministic() {
        let template = "${db_address}-${server_port}-${db_address}";
        let a = render(template, &vars()).unwrap();
        let b = render(template, &vars()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "10.0.0.5-8080-10.0.0.5");
    }

    #[test]
    fn test_template_placeholders() {
        let names = placeholders("${b} ${a} $${skip} ${b}");
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_template_malformed_placeholder_rejected() {
        let err = render("port=${server_port} db=${db-port}", &vars()).unwrap_err();
        assert_eq!(
            err,
            RenderError::MalformedPlaceholder {
                text: "${db-port}".into()
            }
        );
        for template in ["x=${}", "${1x}", "${ }"] {
            assert!(
                matches!(render(template, &vars()), Err(RenderError::MalformedPlaceholder { .. })),
                "{template}"
            );
        }
        // an escaped brace is still literal
        assert_eq!(render("$${db-port}", &vars()).unwrap(), "${db-port}");
    }

    #[test]
    fn test_template_placeholders_include_malformed() {
        let names = placeholders("${server_port} ${db-port} ${} $${skip}");
        assert_eq!(names, vec!["server_port", "db-port", ""]);
    }

    #[test]
    fn test_template_encode_user_data() {
        assert_eq!(encode_user_data("hello"), "aGVsbG8=");
    }
}
