use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use comfyrun_comfyui::engine::{EngineConfig, ImageSource};
use comfyrun_comfyui::readiness::ReadinessConfig;
use comfyrun_comfyui::retry::RetryConfig;

/// A configuration value that could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The variable is set but does not parse.
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Log output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'text' or 'json', got '{other}'")),
        }
    }
}

/// Worker configuration loaded from environment variables.
///
/// Every field has a default matching the stock serverless image layout,
/// so an empty environment yields a working configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the ComfyUI HTTP API.
    pub comfyui_url: String,
    /// Directory holding `<name>.json` / `<name>.params.json` templates.
    pub workflow_dir: PathBuf,
    /// Shared output volume. When unset, images are downloaded via `/view`.
    pub output_volume: Option<PathBuf>,
    /// Upper bound on one job, from submission to fetched images.
    pub job_timeout: Duration,
    /// Per-request timeout of the shared HTTP client.
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub http_max_retries: u32,
    pub http_backoff: Duration,
    /// Attach the error source chain to error results.
    pub include_error_details: bool,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            comfyui_url: "http://127.0.0.1:3000".to_string(),
            workflow_dir: PathBuf::from("/workspace/workflows"),
            output_volume: None,
            job_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(200),
            http_max_retries: 10,
            http_backoff: Duration::from_millis(100),
            include_error_details: true,
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_format: LogFormat::Text,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                    |
    /// |-------------------------|----------------------------|
    /// | `COMFYUI_URL`           | `http://127.0.0.1:3000`    |
    /// | `WORKFLOW_DIR`          | `/workspace/workflows`     |
    /// | `OUTPUT_VOLUME`         | unset (download via HTTP)  |
    /// | `JOB_TIMEOUT_SECS`      | `600`                      |
    /// | `REQUEST_TIMEOUT_SECS`  | `600`                      |
    /// | `POLL_INTERVAL_MS`      | `200`                      |
    /// | `HTTP_MAX_RETRIES`      | `10`                       |
    /// | `HTTP_BACKOFF_MS`       | `100`                      |
    /// | `INCLUDE_ERROR_DETAILS` | `true`                     |
    /// | `HOST`                  | `0.0.0.0`                  |
    /// | `PORT`                  | `8000`                     |
    /// | `LOG_FORMAT`            | `text` (`json` available)  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        Ok(Self {
            comfyui_url: get("COMFYUI_URL").unwrap_or(defaults.comfyui_url),
            workflow_dir: get("WORKFLOW_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workflow_dir),
            output_volume: get("OUTPUT_VOLUME").map(PathBuf::from),
            job_timeout: parse_var(&get, "JOB_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            request_timeout: parse_var(&get, "REQUEST_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            poll_interval: parse_var(&get, "POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            http_max_retries: parse_var(&get, "HTTP_MAX_RETRIES")?
                .unwrap_or(defaults.http_max_retries),
            http_backoff: parse_var(&get, "HTTP_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.http_backoff),
            include_error_details: match get("INCLUDE_ERROR_DETAILS") {
                Some(value) => parse_bool("INCLUDE_ERROR_DETAILS", &value)?,
                None => defaults.include_error_details,
            },
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_var(&get, "PORT")?.unwrap_or(defaults.port),
            log_format: parse_var(&get, "LOG_FORMAT")?.unwrap_or(defaults.log_format),
        })
    }

    /// Address the front door binds to.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.host.parse().map_err(|e: std::net::AddrParseError| {
            ConfigError::Invalid {
                var: "HOST",
                value: self.host.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.http_max_retries,
            backoff_factor: self.http_backoff,
            ..RetryConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: self.poll_interval,
            image_source: match &self.output_volume {
                Some(root) => ImageSource::SharedVolume(root.clone()),
                None => ImageSource::Http,
            },
        }
    }

    pub fn readiness_config(&self) -> ReadinessConfig {
        ReadinessConfig::default()
    }
}

fn parse_var<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
