use std::collections::HashMap;

const FULL_TEMPLATE: &str = include_str!("analyst_full.md");
const COMPACT_TEMPLATE: &str = include_str!("analyst_compact.md");

/// Substitute `{{name}}` placeholders. Unknown placeholders are left as-is.
pub fn render_prompt(template: &str, vars: &HashMap<&str, String>) -> String {
    vars.iter().fold(template.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{{{key}}}}}"), value)
    })
}

/// Chooses and renders the analyst system prompt.
#[derive(Debug, Clone)]
pub struct PromptSet {
    compact_patterns: Vec<String>,
}

impl PromptSet {
    pub fn new(compact_patterns: Vec<String>) -> Self {
        Self { compact_patterns }
    }

    /// Small models get the compact prompt without the worked example.
    pub fn uses_compact(&self, model_name: &str) -> bool {
        self.compact_patterns
            .iter()
            .any(|p| !p.is_empty() && model_name.contains(p.as_str()))
    }

    pub fn system_prompt(&self, model_name: &str, schema: &str) -> String {
        let template = if self.uses_compact(model_name) {
            COMPACT_TEMPLATE
        } else {
            FULL_TEMPLATE
        };
        let vars = HashMap::from([("schema", schema.to_string())]);
        render_prompt(template, &vars)
    }
}
