use serde_json::{Map, Value};

/// Replaces every `{{name}}` placeholder with the string form of the
/// matching variable.
///
/// Absent or `null` variables render as the empty string. No recursive
/// expansion and no escaping is performed; the delivery channel owns any
/// output encoding. Unterminated `{{` sequences pass through literally.
pub fn render(template: &str, variables: &Map<String, Value>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let name = after_open[..close].trim();
                output.push_str(&variable_text(variables.get(name)));
                rest = &after_open[close + 2..];
            }
            None => {
                output.push_str(&rest[open..]);
                return output;
            }
        }
    }

    output.push_str(rest);
    output
}

fn variable_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().expect("object").clone()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let variables = vars(json!({"name": "Riley", "days": 7}));
        let rendered = render("Hey {{name}}, it's been {{days}} days!", &variables);
        assert_eq!(rendered, "Hey Riley, it's been 7 days!");
    }

    #[test]
    fn unknown_placeholder_renders_empty() {
        let variables = vars(json!({}));
        assert_eq!(render("Hello {{missing}}!", &variables), "Hello !");
    }

    #[test]
    fn null_variable_renders_empty() {
        let variables = vars(json!({"name": null}));
        assert_eq!(render("Hi {{name}}.", &variables), "Hi .");
    }

    #[test]
    fn whitespace_inside_braces_is_trimmed() {
        let variables = vars(json!({"name": "Ash"}));
        assert_eq!(render("{{ name }}", &variables), "Ash");
    }

    #[test]
    fn unterminated_braces_pass_through() {
        let variables = vars(json!({"name": "Ash"}));
        assert_eq!(render("broken {{name", &variables), "broken {{name");
    }

    #[test]
    fn no_recursive_expansion() {
        let variables = vars(json!({"a": "{{b}}", "b": "nested"}));
        assert_eq!(render("{{a}}", &variables), "{{b}}");
    }

    #[test]
    fn booleans_render_bare() {
        let variables = vars(json!({"active": false}));
        assert_eq!(render("active={{active}}", &variables), "active=false");
    }
}
