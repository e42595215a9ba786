use std::sync::LazyLock;

use regex::Regex;

use super::error::AnalysisError;
use super::parser::report_span;
use super::session::ContentItem;
use crate::executor::ScriptExecutor;
use crate::executor::protocol::VariableItem;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([^{}]+?)\}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Placeholders that fail to resolve are logged and dropped.
    Tolerant,
    /// The first unresolved placeholder fails the render.
    Strict,
}

/// Turns a finished report into typed content, resolving `{expression}`
/// placeholders through the executor.
pub struct ContentRenderer<'a> {
    executor: &'a dyn ScriptExecutor,
    mode: RenderMode,
}

impl<'a> ContentRenderer<'a> {
    pub fn new(executor: &'a dyn ScriptExecutor, mode: RenderMode) -> Self {
        Self { executor, mode }
    }

    /// Render the report span of `text` (or all of it when it has none).
    pub async fn render(&self, key: &str, text: &str) -> Result<Vec<ContentItem>, AnalysisError> {
        let report = report_span(text);
        let mut content = Vec::new();
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(report) {
            let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            push_markdown(&mut content, &report[last..whole.start()]);
            last = whole.end();

            match self.executor.read_variable(key, expr.as_str()).await {
                Ok(items) => content.extend(items.into_iter().map(content_item)),
                Err(e) => {
                    tracing::warn!(key = %key, expression = %expr.as_str(), error = %e, "placeholder not resolved");
                    if self.mode == RenderMode::Strict {
                        return Err(AnalysisError::VariableResolution {
                            name: expr.as_str().to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        push_markdown(&mut content, &report[last..]);
        Ok(content)
    }
}

fn push_markdown(content: &mut Vec<ContentItem>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        content.push(ContentItem::markdown(text));
    }
}

fn content_item(item: VariableItem) -> ContentItem {
    match item.kind.as_str() {
        "image" => ContentItem::Image { base64: item.data },
        "table" => ContentItem::Table { table: item.data },
        _ => ContentItem::Variable { data: item.data },
    }
}
