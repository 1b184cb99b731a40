#![forbid(unsafe_code)]

//! Service configuration.
//!
//! Values are looked up in this order: explicit overrides (CLI flags), the
//! process environment, then a `.env` file. Anything still missing falls back
//! to a default; malformed numbers do too, while an unknown download strategy
//! is reported as an error.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    media::{DEFAULT_FFMPEG_BIN, DEFAULT_YTDLP_BIN, ToolTimeouts, YtDlp},
    orchestrator::{DEFAULT_MAX_TITLE_BYTES, DownloadStrategy, JobOptions},
    resolver::RetryPolicy,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "./downloads";
pub const DEFAULT_BUNDLER_PORT: u16 = 5000;
pub const DEFAULT_BUNDLER_HOST: &str = "127.0.0.1";
pub const DEFAULT_RESOLVE_RETRIES: u32 = 2;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub download_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub strategy: DownloadStrategy,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub timeouts: ToolTimeouts,
    pub resolve_retries: u32,
    pub max_title_bytes: usize,
}

impl ServiceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.resolve_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            strategy: self.strategy,
            max_title_bytes: self.max_title_bytes,
            retry: self.retry_policy(),
        }
    }

    pub fn media_tool(&self) -> YtDlp {
        YtDlp::new(&self.ytdlp_bin, &self.ffmpeg_bin, self.timeouts)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub download_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub strategy: Option<DownloadStrategy>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<ServiceConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<ServiceConfig> {
    build_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<ServiceConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let download_root = overrides
        .download_root
        .or_else(|| lookup("DOWNLOAD_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_ROOT));
    let port = overrides
        .port
        .or_else(|| lookup("BUNDLER_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_BUNDLER_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("BUNDLER_HOST"))
        .unwrap_or_else(|| DEFAULT_BUNDLER_HOST.to_string());
    let strategy = match overrides.strategy {
        Some(strategy) => strategy,
        None => match lookup("DOWNLOAD_STRATEGY") {
            Some(value) => DownloadStrategy::parse(&value)
                .ok_or_else(|| anyhow!("unknown DOWNLOAD_STRATEGY: {value}"))?,
            None => DownloadStrategy::default(),
        },
    };

    let defaults = ToolTimeouts::default();
    let timeouts = ToolTimeouts {
        metadata: lookup_secs("METADATA_TIMEOUT_SECS", &lookup).unwrap_or(defaults.metadata),
        download: lookup_secs("DOWNLOAD_TIMEOUT_SECS", &lookup).unwrap_or(defaults.download),
        mux: lookup_secs("MUX_TIMEOUT_SECS", &lookup).unwrap_or(defaults.mux),
    };

    Ok(ServiceConfig {
        download_root,
        host,
        port,
        strategy,
        ytdlp_bin: PathBuf::from(
            lookup("YTDLP_BIN").unwrap_or_else(|| DEFAULT_YTDLP_BIN.to_string()),
        ),
        ffmpeg_bin: PathBuf::from(
            lookup("FFMPEG_BIN").unwrap_or_else(|| DEFAULT_FFMPEG_BIN.to_string()),
        ),
        timeouts,
        resolve_retries: lookup("RESOLVE_RETRIES")
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RESOLVE_RETRIES),
        max_title_bytes: lookup("MAX_TITLE_BYTES")
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(DEFAULT_MAX_TITLE_BYTES))
            .unwrap_or(DEFAULT_MAX_TITLE_BYTES),
    })
}

/// Positive whole seconds; zero and garbage count as unset.
fn lookup_secs(key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<Duration> {
    lookup(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file is not an error.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> ServiceConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_config(&vars, |_| None).unwrap()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = build_config(&HashMap::new(), |_| None).unwrap();
        assert_eq!(config.download_root, PathBuf::from(DEFAULT_DOWNLOAD_ROOT));
        assert_eq!(config.port, DEFAULT_BUNDLER_PORT);
        assert_eq!(config.host, DEFAULT_BUNDLER_HOST);
        assert_eq!(config.strategy, DownloadStrategy::Delegated);
        assert_eq!(config.ytdlp_bin, PathBuf::from("yt-dlp"));
        assert_eq!(config.ffmpeg_bin, PathBuf::from("ffmpeg"));
        assert_eq!(config.resolve_retries, DEFAULT_RESOLVE_RETRIES);
        assert_eq!(config.max_title_bytes, DEFAULT_MAX_TITLE_BYTES);
        assert_eq!(config.timeouts.metadata, Duration::from_secs(120));
    }

    #[test]
    fn reads_values_from_env_file() {
        let config = config_from(
            "DOWNLOAD_ROOT=\"/srv/jobs\"\nBUNDLER_PORT=\"8088\"\nDOWNLOAD_STRATEGY=manual\n\
             METADATA_TIMEOUT_SECS=30\nRESOLVE_RETRIES=0\nMAX_TITLE_BYTES=80\n",
        );
        assert_eq!(config.download_root, PathBuf::from("/srv/jobs"));
        assert_eq!(config.port, 8088);
        assert_eq!(config.strategy, DownloadStrategy::Manual);
        assert_eq!(config.timeouts.metadata, Duration::from_secs(30));
        assert_eq!(config.resolve_retries, 0);
        assert_eq!(config.max_title_bytes, 80);
        assert_eq!(config.job_options().max_title_bytes, 80);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config_from(
            "BUNDLER_PORT=\"nope\"\nMUX_TIMEOUT_SECS=0\nDOWNLOAD_TIMEOUT_SECS=-4\nMAX_TITLE_BYTES=0\n",
        );
        assert_eq!(config.port, DEFAULT_BUNDLER_PORT);
        assert_eq!(config.timeouts.mux, ToolTimeouts::default().mux);
        assert_eq!(config.timeouts.download, ToolTimeouts::default().download);
        assert_eq!(config.max_title_bytes, DEFAULT_MAX_TITLE_BYTES);
    }

    #[test]
    fn title_budget_never_exceeds_default() {
        let config = config_from("MAX_TITLE_BYTES=4000\n");
        assert_eq!(config.max_title_bytes, DEFAULT_MAX_TITLE_BYTES);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let vars = read_env_file(make_config("DOWNLOAD_STRATEGY=parallel\n").path()).unwrap();
        let err = build_config(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("unknown DOWNLOAD_STRATEGY"));
    }

    #[test]
    fn environment_wins_over_file() {
        let vars = read_env_file(make_config("DOWNLOAD_ROOT=\"/file\"\n").path()).unwrap();
        let config = build_config(&vars, |key| {
            if key == "DOWNLOAD_ROOT" {
                Some("/env".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(config.download_root, PathBuf::from("/env"));
    }

    #[test]
    fn overrides_win_over_everything() {
        let mut vars = HashMap::new();
        vars.insert("DOWNLOAD_ROOT".to_string(), "/file-root".to_string());
        vars.insert("BUNDLER_HOST".to_string(), "file-host".to_string());
        vars.insert("BUNDLER_PORT".to_string(), "7000".to_string());
        vars.insert("DOWNLOAD_STRATEGY".to_string(), "delegated".to_string());

        let overrides = ConfigOverrides {
            download_root: Some(PathBuf::from("/override-root")),
            host: Some("0.0.0.0".into()),
            port: None,
            strategy: Some(DownloadStrategy::Manual),
            env_path: None,
        };

        let config = build_config_with_overrides(
            &vars,
            |key| (key == "BUNDLER_PORT").then(|| "8000".to_string()),
            overrides,
        )
        .unwrap();

        assert_eq!(config.download_root, PathBuf::from("/override-root"));
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.strategy, DownloadStrategy::Manual);
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let config = build_config_with_overrides(
            &HashMap::new(),
            |_| None,
            ConfigOverrides {
                host: Some("   ".into()),
                ..ConfigOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.host, DEFAULT_BUNDLER_HOST);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export DOWNLOAD_ROOT="/media"
            YTDLP_BIN='/opt/yt-dlp'
            BUNDLER_HOST =  "0.0.0.0"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("DOWNLOAD_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("YTDLP_BIN").unwrap(), "/opt/yt-dlp");
        assert_eq!(vars.get("BUNDLER_HOST").unwrap(), "0.0.0.0");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }
}
