use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("engine config: {0}")]
    Config(#[from] memsan_engine::config::ConfigError),
    #[error("unknown scenario '{0}' (expected one of a, b, c, d, all)")]
    UnknownScenario(String),
    #[error("{failed} of {total} scenarios failed")]
    ScenariosFailed { failed: usize, total: usize },
    #[error("{count} invalid evidence lines")]
    InvalidEvidence { count: usize },
}
