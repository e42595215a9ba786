use std::path::{Path, PathBuf};

use anyhow::Context;

use super::parser::{REPORT_CLOSE, REPORT_OPEN, SCRIPT_CLOSE, SCRIPT_OPEN, THINK_CLOSE, THINK_OPEN};

const QUERY_PREFIX_CHARS: usize = 30;

/// Markers that occur more than once in a finished response.
pub fn repeated_markers(response: &str) -> Vec<&'static str> {
    [THINK_OPEN, THINK_CLOSE, SCRIPT_OPEN, SCRIPT_CLOSE, REPORT_OPEN, REPORT_CLOSE]
        .into_iter()
        .filter(|marker| response.matches(marker).count() > 1)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportBucket {
    Good,
    CodeError,
    TagError,
}

impl ExportBucket {
    pub fn dir_name(self) -> &'static str {
        match self {
            ExportBucket::Good => "good",
            ExportBucket::CodeError => "codeerror",
            ExportBucket::TagError => "tagerror",
        }
    }
}

pub fn export_file_name(query: &str, model: &str) -> String {
    let safe: String = query
        .chars()
        .take(QUERY_PREFIX_CHARS)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{safe}-{model}.md").replace('/', "_")
}

/// Audits finished responses and optionally files them for later review.
#[derive(Debug, Clone, Default)]
pub struct ReportAuditor {
    export_dir: Option<PathBuf>,
}

impl ReportAuditor {
    pub fn new(export_dir: Option<PathBuf>) -> Self {
        Self { export_dir }
    }

    pub fn classify(response: &str, recovered: bool) -> ExportBucket {
        let repeated = repeated_markers(response);
        if !repeated.is_empty() {
            tracing::warn!(markers = ?repeated, "response tags are not balanced");
            ExportBucket::TagError
        } else if recovered {
            ExportBucket::CodeError
        } else {
            ExportBucket::Good
        }
    }

    /// Classify and, when an export directory is configured, write
    /// `query` and `response` under it.
    pub async fn record(
        &self,
        model: &str,
        query: &str,
        response: &str,
        recovered: bool,
    ) -> anyhow::Result<Option<PathBuf>> {
        let bucket = Self::classify(response, recovered);
        let Some(root) = &self.export_dir else {
            return Ok(None);
        };
        let path = write_export(root, bucket, model, query, response).await?;
        tracing::info!(path = %path.display(), "report exported");
        Ok(Some(path))
    }
}

async fn write_export(
    root: &Path,
    bucket: ExportBucket,
    model: &str,
    query: &str,
    response: &str,
) -> anyhow::Result<PathBuf> {
    let dir = root.join(bucket.dir_name());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(export_file_name(query, model));
    tokio::fs::write(&path, format!("{query}\n\n{response}"))
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
