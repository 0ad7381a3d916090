use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "slideq.toml";
const ENV_PREFIX: &str = "SLIDEQ_";

/// Output the server should produce for reconstructed slides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Html,
    Pptx,
    #[default]
    Both,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Html => "html",
            OutputFormat::Pptx => "pptx",
            OutputFormat::Both => "both",
        }
    }
}

/// Per-submission processing choices, forwarded verbatim to the server.
/// Resolved by the caller for each submission; never read from global state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    pub vision_model: String,
    pub inpainting_model: String,
    pub codegen_model: String,
    pub output_format: OutputFormat,
    pub font_family: String,
    pub refine_layout: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_text: Option<String>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            vision_model: "gemini-3-flash-preview".to_string(),
            inpainting_model: "opencv-telea".to_string(),
            codegen_model: "algorithmic".to_string(),
            output_format: OutputFormat::Both,
            font_family: "Malgun Gothic".to_string(),
            refine_layout: false,
            exclude_text: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the processing server.
    pub server_url: String,
    /// Jobs allowed in flight at once.
    pub max_concurrent: usize,
    /// Force `error` on jobs that have not settled after this many seconds.
    /// Unset means jobs may wait on the server indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_timeout_secs: Option<u64>,
    pub connect_timeout_secs: u64,
    /// Use the in-process simulated transport instead of the server.
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub processing: ProcessingOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            max_concurrent: 3,
            job_timeout_secs: None,
            connect_timeout_secs: 10,
            simulation: false,
            verbose: false,
            json_logs: false,
            processing: ProcessingOptions::default(),
        }
    }
}

impl AppConfig {
    /// Resolve configuration: defaults, then the TOML file, then `SLIDEQ_*`
    /// environment variables, then `overrides` (typically CLI flags that were
    /// actually given).
    ///
    /// `config_file` must exist when given explicitly; the default
    /// `slideq.toml` is optional.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file: PathBuf = match config_file {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if self.server_url.trim().is_empty() {
            bail!("server_url must not be empty");
        }
        if self.job_timeout_secs == Some(0) {
            bail!("job_timeout_secs must be greater than 0 when set");
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Flags {
        #[serde(skip_serializing_if = "Option::is_none")]
        max_concurrent: Option<usize>,
    }

    #[test]
    fn defaults_without_file_or_env() {
        Jail::expect_with(|_jail| {
            let cfg = AppConfig::new(None, None::<&Flags>).unwrap();
            assert_eq!(cfg, AppConfig::default());
            assert_eq!(cfg.max_concurrent, 3);
            assert!(cfg.job_timeout().is_none());
            Ok(())
        });
    }

    #[test]
    fn file_then_env_then_flags() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                    server_url = "http://gpu-box:9000"
                    max_concurrent = 5
                    job_timeout_secs = 600

                    [processing]
                    font_family = "Noto Sans KR"
                    output_format = "pptx"
                "#,
            )?;
            jail.set_env("SLIDEQ_MAX_CONCURRENT", "4");
            jail.set_env("SLIDEQ_PROCESSING__REFINE_LAYOUT", "true");

            let cfg = AppConfig::new(None, None::<&Flags>).unwrap();
            assert_eq!(cfg.server_url, "http://gpu-box:9000");
            assert_eq!(cfg.max_concurrent, 4);
            assert_eq!(cfg.job_timeout(), Some(Duration::from_secs(600)));
            assert_eq!(cfg.processing.font_family, "Noto Sans KR");
            assert_eq!(cfg.processing.output_format, OutputFormat::Pptx);
            assert!(cfg.processing.refine_layout);
            assert_eq!(cfg.processing.vision_model, "gemini-3-flash-preview");

            let flags = Flags {
                max_concurrent: Some(1),
            };
            let cfg = AppConfig::new(None, Some(&flags)).unwrap();
            assert_eq!(cfg.max_concurrent, 1);
            Ok(())
        });
    }

    #[test]
    fn unset_flags_do_not_override() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, "max_concurrent = 7")?;
            let flags = Flags {
                max_concurrent: None,
            };
            let cfg = AppConfig::new(None, Some(&flags)).unwrap();
            assert_eq!(cfg.max_concurrent, 7);
            Ok(())
        });
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, "max_concurrent = 0")?;
            let err = AppConfig::new(None, None::<&Flags>).unwrap_err();
            assert!(err.to_string().contains("max_concurrent"));
            Ok(())
        });
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::new(Some(&missing), None::<&Flags>).is_err());
    }

    #[test]
    fn toml_output_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut cfg = AppConfig::default();
        cfg.max_concurrent = 6;
        cfg.processing.exclude_text = Some("CONFIDENTIAL".to_string());
        std::fs::write(&path, cfg.to_toml().unwrap()).unwrap();

        let loaded = AppConfig::new(Some(&path), None::<&Flags>).unwrap();
        assert_eq!(loaded, cfg);
    }
}
