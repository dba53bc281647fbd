//! Placeholder expansion for hook arguments, webhook URLs, and shell commands.
//!
//! Hooks declare string arguments containing `{{issue_id}}`, `{{branch}}`,
//! `{{pr_number}}`, `{{pr_url}}`, `{{failure_reason}}` (§3/§4.6); these are
//! resolved from the issue record and transition context before evaluation.
//! Shell-destined values are escaped; values bound for plain substitution
//! (YAML field paths, webhook URLs) are not.

use std::collections::HashMap;

use minijinja::Environment;

/// Resolved placeholder values for one hook evaluation.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderContext {
    values: HashMap<String, String>,
}

impl PlaceholderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    /// Expand `template` against this context.
    ///
    /// `shell_escape` shell-quotes every substituted value, for arguments
    /// destined for a shell command; pass `false` for webhook URLs and
    /// structured (file/section/field) arguments where the raw value is
    /// wanted.
    pub fn expand(&self, template: &str, shell_escape: bool) -> anyhow::Result<String> {
        use shell_escape::escape;
        use std::borrow::Cow;

        let mut env = Environment::new();
        if shell_escape {
            env.set_keep_trailing_newline(true);
        }

        let mut context = HashMap::new();
        for (key, value) in &self.values {
            let val = if shell_escape {
                escape(Cow::Borrowed(value.as_str())).to_string()
            } else {
                value.clone()
            };
            context.insert(key.clone(), minijinja::Value::from(val));
        }

        let tmpl = env
            .template_from_str(template)
            .map_err(|e| anyhow::anyhow!("Template syntax error in {template:?}: {e}"))?;
        tmpl.render(minijinja::Value::from_object(context))
            .map_err(|e| anyhow::anyhow!("Template render error in {template:?}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_placeholders() {
        let ctx = PlaceholderContext::new()
            .with("issue_id", "042")
            .with("branch", "issue-042-add-dark-mode");
        let out = ctx.expand("issue {{issue_id}} on {{branch}}", false).unwrap();
        assert_eq!(out, "issue 042 on issue-042-add-dark-mode");
    }

    #[test]
    fn leaves_missing_placeholders_empty() {
        let ctx = PlaceholderContext::new();
        let out = ctx.expand("pr {{pr_number}}", false).unwrap();
        assert_eq!(out, "pr ");
    }

    #[test]
    fn shell_escapes_when_requested() {
        let ctx = PlaceholderContext::new().with("failure_reason", "CI failed; rm -rf /");
        let out = ctx.expand("echo {{failure_reason}}", true).unwrap();
        assert!(out.contains('\''));
    }

    #[test]
    fn with_opt_skips_none() {
        let ctx = PlaceholderContext::new().with_opt::<String>("pr_number", None);
        let out = ctx.expand("{{pr_number}}", false).unwrap();
        assert_eq!(out, "");
    }
}
