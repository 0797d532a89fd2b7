//! `{{dotted.path}}` command templates
//!
//! Placeholders are looked up in the normalized event first and in the raw
//! payload second, so a template can name either `{{branch}}` or
//! `{{repository.homepage}}`.

use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{HookError, Result};
use crate::webhook::WebhookEvent;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([^{}]+)\}\}").expect("placeholder pattern is valid")
});

/// A command line template, parsed once per configured hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    keys: Vec<String>,
}

/// Executable plus arguments after substitution. Split on whitespace with no
/// quoting support, so a value containing spaces becomes several arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub executable: String,
    pub args: Vec<String>,
}

impl ResolvedCommand {
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let executable = parts
            .next()
            .ok_or_else(|| HookError::InvalidCommand("command is empty".to_string()))?;
        Ok(Self {
            executable: executable.to_string(),
            args: parts.map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.executable)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

impl CommandTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let mut keys: Vec<String> = Vec::new();
        for cap in PLACEHOLDER.captures_iter(&source) {
            let key = cap[1].to_string();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Self { source, keys }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct placeholder keys in order of first appearance.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Substitute every placeholder. Fails on the first key that does not resolve.
    pub fn render(&self, event: &WebhookEvent) -> Result<String> {
        if self.keys.is_empty() {
            return Ok(self.source.clone());
        }

        let namespace = serde_json::to_value(event).map_err(|e| HookError::TemplateResolution {
            placeholder: self.keys[0].clone(),
            reason: format!("event cannot be serialized: {}", e),
        })?;

        let mut rendered = self.source.clone();
        for key in &self.keys {
            let value = lookup(&namespace, key)
                .or_else(|| lookup(&event.payload, key))
                .ok_or_else(|| HookError::TemplateResolution {
                    placeholder: key.clone(),
                    reason: "no such field in the event or its payload".to_string(),
                })?;
            rendered = rendered.replace(&format!("{{{{{}}}}}", key), &value_to_string(value));
        }
        Ok(rendered)
    }

    pub fn resolve(&self, event: &WebhookEvent) -> Result<ResolvedCommand> {
        ResolvedCommand::from_command_line(&self.render(event)?)
    }
}

/// Walk `path` one dot-separated segment at a time. Objects are indexed by
/// key, arrays by position. `null` counts as missing.
fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.trim().split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Null => None,
        value => Some(value),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::normalize;
    use serde_json::json;

    fn push_event() -> WebhookEvent {
        normalize(&json!({
            "ref": "refs/heads/main",
            "before": "95790bf891e76fee5e1747ab589903a6a1f80f22",
            "after": "da1560886d4f094c3e6c9ef40349f7d38b5d27d7",
            "user_id": 42,
            "user_name": "John Smith",
            "repository": { "name": "Diaspora", "url": "git@example.com:mike/diaspora.git" },
            "commits": [{ "id": "b6568db1", "message": "Update Catalan translation" }]
        }))
    }

    #[test]
    fn resolves_normalized_fields() {
        let cmd = CommandTemplate::new("echo {{branch}} {{user_id}}")
            .resolve(&push_event())
            .unwrap();
        assert_eq!(cmd.executable, "echo");
        assert_eq!(cmd.args, vec!["main", "42"]);
    }

    #[test]
    fn falls_back_to_raw_payload() {
        let cmd = CommandTemplate::new("deploy {{repository.name}} {{commits.0.id}}")
            .resolve(&push_event())
            .unwrap();
        assert_eq!(cmd.args, vec!["Diaspora", "b6568db1"]);
    }

    #[test]
    fn normalized_fields_shadow_payload_fields() {
        let event = push_event();
        let rendered = CommandTemplate::new("{{ref}} {{payload.ref}}")
            .render(&event)
            .unwrap();
        assert_eq!(rendered, "main refs/heads/main");
    }

    #[test]
    fn repeated_placeholders_are_all_replaced() {
        let template = CommandTemplate::new("git checkout {{branch}} && echo {{branch}}");
        assert_eq!(template.keys(), ["branch"]);
        assert_eq!(
            template.render(&push_event()).unwrap(),
            "git checkout main && echo main"
        );
    }

    #[test]
    fn missing_path_is_an_error() {
        let err = CommandTemplate::new("echo {{nonexistent.field}}")
            .resolve(&push_event())
            .unwrap_err();
        match err {
            HookError::TemplateResolution { placeholder, .. } => {
                assert_eq!(placeholder, "nonexistent.field")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cannot_traverse_into_scalars() {
        let result = CommandTemplate::new("echo {{branch.name}}").render(&push_event());
        assert!(matches!(result, Err(HookError::TemplateResolution { .. })));
    }

    #[test]
    fn null_values_do_not_resolve() {
        // `tag` is null for a branch push and absent from the payload
        let result = CommandTemplate::new("echo {{tag}}").render(&push_event());
        assert!(matches!(result, Err(HookError::TemplateResolution { .. })));
    }

    #[test]
    fn whitespace_in_values_splits_arguments() {
        let cmd = CommandTemplate::new("notify {{user_name}}")
            .resolve(&push_event())
            .unwrap();
        assert_eq!(cmd.args, vec!["John", "Smith"]);
    }

    #[test]
    fn template_without_placeholders() {
        let cmd = CommandTemplate::new("npm run deploy")
            .resolve(&push_event())
            .unwrap();
        assert_eq!(cmd.to_string(), "npm run deploy");
    }

    #[test]
    fn empty_command_is_invalid() {
        let result = CommandTemplate::new("   ").resolve(&push_event());
        assert!(matches!(result, Err(HookError::InvalidCommand(_))));
    }

    #[test]
    fn resolution_does_not_mutate_template() {
        let template = CommandTemplate::new("echo {{branch}}");
        let before = template.clone();
        template.resolve(&push_event()).unwrap();
        assert_eq!(template, before);
    }
}
