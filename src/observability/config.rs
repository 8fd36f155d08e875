use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`; `RUST_LOG` directives take precedence
    pub level: String,
    pub format: LogFormat,
    /// Include file/line and thread ids in every event
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            verbose: false,
        }
    }
}

impl LogConfig {
    pub const LEVELS: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    pub fn is_valid_level(&self) -> bool {
        Self::LEVELS.contains(&self.level.to_lowercase().as_str())
    }
}
