use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::labels::LabelPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Retina disease classification service.
#[derive(Debug, Clone, Parser)]
#[command(name = "retina_service", version, about)]
pub struct Config {
    /// Directory holding config.json, preprocessor_config.json and the SavedModel.
    #[arg(long, env = "MODEL_DIR", default_value = "my-trained-vit-model")]
    pub model_dir: PathBuf,

    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Maximum upload size in megabytes.
    #[arg(long, env = "BODY_LIMIT_MB", default_value_t = 10)]
    pub body_limit_mb: usize,

    /// Labels used when the model declares none or only placeholders.
    #[arg(
        long,
        env = "FALLBACK_LABELS",
        value_delimiter = ',',
        default_values = ["CNV", "DME", "DRUSEN", "NORMAL"]
    )]
    pub fallback_labels: Vec<String>,

    /// Keep `LABEL_<n>` names from the model config instead of replacing them.
    #[arg(
        long,
        env = "KEEP_PLACEHOLDER_LABELS",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub keep_placeholder_labels: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb * 1024 * 1024
    }

    pub fn label_policy(&self) -> LabelPolicy {
        let fallback = self
            .fallback_labels
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        LabelPolicy::new(fallback, !self.keep_placeholder_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::OCT_LABELS;
    use std::sync::{Mutex, MutexGuard};

    const ENV_VARS: [&str; 7] = [
        "MODEL_DIR",
        "BIND_HOST",
        "PORT",
        "BODY_LIMIT_MB",
        "FALLBACK_LABELS",
        "KEEP_PLACEHOLDER_LABELS",
        "LOG_FORMAT",
    ];

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that read the process environment and starts them from a clean slate.
    fn clean_env() -> MutexGuard<'static, ()> {
        let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
        guard
    }

    #[test]
    fn defaults() {
        let _env = clean_env();
        let cfg = Config::try_parse_from(["retina_service"]).unwrap();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.socket_addr().to_string(), "0.0.0.0:8000");
        assert_eq!(cfg.body_limit_bytes(), 10 * 1024 * 1024);
        assert_eq!(cfg.fallback_labels, OCT_LABELS);
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert!(!cfg.keep_placeholder_labels);
    }

    #[test]
    fn keep_placeholder_labels_accepts_numeric_env() {
        let _env = clean_env();
        std::env::set_var("KEEP_PLACEHOLDER_LABELS", "1");
        let on = Config::try_parse_from(["retina_service"]);
        std::env::set_var("KEEP_PLACEHOLDER_LABELS", "0");
        let off = Config::try_parse_from(["retina_service"]);
        std::env::remove_var("KEEP_PLACEHOLDER_LABELS");

        assert!(on.unwrap().keep_placeholder_labels);
        assert!(!off.unwrap().keep_placeholder_labels);
    }

    #[test]
    fn env_overrides_defaults() {
        let _env = clean_env();
        std::env::set_var("BODY_LIMIT_MB", "2");
        std::env::set_var("LOG_FORMAT", "json");
        let cfg = Config::try_parse_from(["retina_service"]);
        std::env::remove_var("BODY_LIMIT_MB");
        std::env::remove_var("LOG_FORMAT");

        let cfg = cfg.unwrap();
        assert_eq!(cfg.body_limit_bytes(), 2 * 1024 * 1024);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn flags_override_defaults() {
        let _env = clean_env();
        let cfg = Config::try_parse_from([
            "retina_service",
            "--model-dir",
            "/models/vit",
            "--host",
            "127.0.0.1",
            "--port",
            "5020",
            "--fallback-labels",
            "benign, malignant",
            "--keep-placeholder-labels",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cfg.model_dir, PathBuf::from("/models/vit"));
        assert_eq!(cfg.socket_addr().to_string(), "127.0.0.1:5020");
        assert_eq!(cfg.log_format, LogFormat::Json);

        let fallback = cfg.label_policy().fallback();
        assert_eq!(fallback.len(), 2);
        assert_eq!(fallback.get(1), Some("malignant"));
    }

    #[test]
    fn rejects_bad_port() {
        let _env = clean_env();
        assert!(Config::try_parse_from(["retina_service", "--port", "99999"]).is_err());
    }
}
