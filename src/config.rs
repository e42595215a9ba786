use std::path::PathBuf;
use std::time::Duration;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub executor_port: u16,
    /// Remote executor host. Scripts run in-process when unset.
    pub executor_url: Option<String>,
    pub database_path: Option<PathBuf>,
    /// Model server to discover models from at startup.
    pub llm_base_url: Option<String>,
    pub llm_api_key: String,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub report_export_dir: Option<PathBuf>,
    /// Model name fragments that get the compact system prompt.
    pub compact_prompt_models: Vec<String>,
    /// Wall-clock limit for one script run.
    pub script_time_limit: Duration,
}

/// Environment values before parsing, one field per variable.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawValues<'a> {
    pub port: Option<&'a str>,
    pub executor_port: Option<&'a str>,
    pub executor_url: Option<&'a str>,
    pub database_path: Option<&'a str>,
    pub llm_base_url: Option<&'a str>,
    pub llm_api_key: Option<&'a str>,
    pub sentry_dsn: Option<&'a str>,
    pub environment: Option<&'a str>,
    pub report_export_dir: Option<&'a str>,
    pub compact_prompt_models: Option<&'a str>,
    pub script_time_limit: Option<&'a str>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

impl Config {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        let port = var("PORT");
        let executor_port = var("EXECUTOR_PORT");
        let executor_url = var("EXECUTOR_URL");
        let database_path = var("DATABASE_PATH");
        let llm_base_url = var("LLM_BASE_URL");
        let llm_api_key = var("LLM_API_KEY");
        let sentry_dsn = var("SENTRY_DSN");
        let environment = var("ENVIRONMENT");
        let report_export_dir = var("REPORT_EXPORT_DIR");
        let compact_prompt_models = var("COMPACT_PROMPT_MODELS");
        let script_time_limit = var("SCRIPT_TIME_LIMIT_SECS");

        Self::from_raw_values(RawValues {
            port: port.as_deref(),
            executor_port: executor_port.as_deref(),
            executor_url: executor_url.as_deref(),
            database_path: database_path.as_deref(),
            llm_base_url: llm_base_url.as_deref(),
            llm_api_key: llm_api_key.as_deref(),
            sentry_dsn: sentry_dsn.as_deref(),
            environment: environment.as_deref(),
            report_export_dir: report_export_dir.as_deref(),
            compact_prompt_models: compact_prompt_models.as_deref(),
            script_time_limit: script_time_limit.as_deref(),
        })
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(raw: RawValues<'_>) -> Self {
        let port = raw.port.and_then(|v| v.parse().ok()).unwrap_or(8081);
        let executor_port = raw.executor_port.and_then(|v| v.parse().ok()).unwrap_or(8082);
        let script_time_limit = raw
            .script_time_limit
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        let compact_prompt_models = match raw.compact_prompt_models {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => vec!["quelmap".to_string(), "lightning".to_string()],
        };

        Config {
            port,
            executor_port,
            executor_url: non_empty(raw.executor_url),
            database_path: non_empty(raw.database_path).map(PathBuf::from),
            llm_base_url: non_empty(raw.llm_base_url),
            llm_api_key: non_empty(raw.llm_api_key).unwrap_or_default(),
            sentry_dsn: non_empty(raw.sentry_dsn),
            environment: non_empty(raw.environment).unwrap_or_else(|| "local".to_string()),
            report_export_dir: non_empty(raw.report_export_dir).map(PathBuf::from),
            compact_prompt_models,
            script_time_limit,
        }
    }
}
