//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "stampa";
const DEFAULT_APP_ID: &str = "stampa";
const DEFAULT_RENDER_CONCURRENCY: usize = 2;
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PROGRESS_TICK_MS: u64 = 60;
const DEFAULT_OUTPUT_DIR: &str = "exports";

/// Command-line arguments for the stampa binary.
#[derive(Debug, Parser)]
#[command(name = "stampa", version, about = "Page export pipeline")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STAMPA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Export selected canvas regions as one deliverable.
    Pages(PagesArgs),
    /// Export one personalized variant per invitee.
    Invitations(InvitationsArgs),
}

#[derive(Debug, Args, Clone)]
pub struct PagesArgs {
    #[command(flatten)]
    pub overrides: ExportOverrides,

    /// Subject (document) identifier.
    #[arg(long, value_name = "ID")]
    pub subject: String,

    /// Block identifiers of the regions to export, in output order.
    #[arg(long = "block", value_name = "ID", required = true)]
    pub blocks: Vec<String>,

    /// Session label used for output naming.
    #[arg(long, default_value = "pages")]
    pub label: String,

    /// Rendered image width in pixels.
    #[arg(long, default_value_t = 1080)]
    pub width: u32,

    /// Rendered image height in pixels.
    #[arg(long, default_value_t = 1920)]
    pub height: u32,

    /// Image format suffix.
    #[arg(long, default_value = "png")]
    pub format: String,
}

#[derive(Debug, Args, Clone)]
pub struct InvitationsArgs {
    #[command(flatten)]
    pub overrides: ExportOverrides,

    /// Subject (document) identifier.
    #[arg(long, value_name = "ID")]
    pub subject: String,

    /// Block identifier of the region to personalize.
    #[arg(long = "block", value_name = "ID")]
    pub block: String,

    /// Invitee tokens, one personalized render per token.
    #[arg(long = "invitee", value_name = "TOKEN", required = true)]
    pub invitees: Vec<String>,

    /// Session label used for output naming.
    #[arg(long, default_value = "invitations")]
    pub label: String,

    /// Rendered image width in pixels.
    #[arg(long, default_value_t = 1080)]
    pub width: u32,

    /// Rendered image height in pixels.
    #[arg(long, default_value_t = 1920)]
    pub height: u32,

    /// Image format suffix.
    #[arg(long, default_value = "png")]
    pub format: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ExportOverrides {
    /// Override the render service endpoint.
    #[arg(long = "render-endpoint", value_name = "URL")]
    pub render_endpoint: Option<String>,

    /// Override the application identifier sent to the render service.
    #[arg(long = "render-app-id", value_name = "ID")]
    pub render_app_id: Option<String>,

    /// Override the render request concurrency bound.
    #[arg(long = "render-concurrency", value_name = "COUNT")]
    pub render_concurrency: Option<usize>,

    /// Override the render request timeout.
    #[arg(long = "render-timeout-seconds", value_name = "SECONDS")]
    pub render_timeout_seconds: Option<u64>,

    /// Override the progress tick cadence.
    #[arg(long = "progress-tick-ms", value_name = "MILLIS")]
    pub progress_tick_ms: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the output directory for deliverables.
    #[arg(long = "output-directory", value_name = "PATH")]
    pub output_directory: Option<PathBuf>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub render: RenderServiceSettings,
    pub progress: ProgressSettings,
    pub logging: LoggingSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone)]
pub struct RenderServiceSettings {
    pub endpoint: Url,
    pub app_id: String,
    pub concurrency: NonZeroUsize,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProgressSettings {
    pub tick_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub directory: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("STAMPA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Pages(args) => raw.apply_overrides(&args.overrides),
        Command::Invitations(args) => raw.apply_overrides(&args.overrides),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    render: RawRenderSettings,
    progress: RawProgressSettings,
    logging: RawLoggingSettings,
    output: RawOutputSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &ExportOverrides) {
        if let Some(endpoint) = overrides.render_endpoint.as_ref() {
            self.render.endpoint = Some(endpoint.clone());
        }
        if let Some(app_id) = overrides.render_app_id.as_ref() {
            self.render.app_id = Some(app_id.clone());
        }
        if let Some(concurrency) = overrides.render_concurrency {
            self.render.concurrency = Some(concurrency);
        }
        if let Some(seconds) = overrides.render_timeout_seconds {
            self.render.timeout_seconds = Some(seconds);
        }
        if let Some(millis) = overrides.progress_tick_ms {
            self.progress.tick_ms = Some(millis);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(directory) = overrides.output_directory.as_ref() {
            self.output.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            render,
            progress,
            logging,
            output,
        } = raw;

        let render = build_render_settings(render)?;
        let progress = build_progress_settings(progress)?;
        let logging = build_logging_settings(logging)?;
        let output = build_output_settings(output)?;

        Ok(Self {
            render,
            progress,
            logging,
            output,
        })
    }
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderServiceSettings, LoadError> {
    let endpoint = render
        .endpoint
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            LoadError::invalid("render.endpoint", "render service endpoint must be configured")
        })?;
    let endpoint = Url::parse(endpoint)
        .map_err(|err| LoadError::invalid("render.endpoint", format!("invalid url: {err}")))?;

    let app_id = render
        .app_id
        .unwrap_or_else(|| DEFAULT_APP_ID.to_string());
    if app_id.trim().is_empty() {
        return Err(LoadError::invalid("render.app_id", "must not be empty"));
    }

    let concurrency_value = render.concurrency.unwrap_or(DEFAULT_RENDER_CONCURRENCY);
    let concurrency = NonZeroUsize::new(concurrency_value)
        .ok_or_else(|| LoadError::invalid("render.concurrency", "must be greater than zero"))?;

    let timeout_seconds = render.timeout_seconds.unwrap_or(DEFAULT_RENDER_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "render.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RenderServiceSettings {
        endpoint,
        app_id,
        concurrency,
        request_timeout: Duration::from_secs(timeout_seconds),
    })
}

fn build_progress_settings(progress: RawProgressSettings) -> Result<ProgressSettings, LoadError> {
    let tick_ms = progress.tick_ms.unwrap_or(DEFAULT_PROGRESS_TICK_MS);
    if tick_ms == 0 {
        return Err(LoadError::invalid(
            "progress.tick_ms",
            "must be greater than zero",
        ));
    }

    Ok(ProgressSettings {
        tick_interval: Duration::from_millis(tick_ms),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_output_settings(output: RawOutputSettings) -> Result<OutputSettings, LoadError> {
    let directory = output
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid("output.directory", "must not be empty"));
    }

    Ok(OutputSettings { directory })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    endpoint: Option<String>,
    app_id: Option<String>,
    concurrency: Option<usize>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProgressSettings {
    tick_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOutputSettings {
    directory: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with_endpoint() -> RawSettings {
        let mut raw = RawSettings::default();
        raw.render.endpoint = Some("https://render.example/shots".to_string());
        raw
    }

    #[test]
    fn endpoint_is_required() {
        let raw = RawSettings::default();
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid {
                key: "render.endpoint",
                ..
            })
        ));
    }

    #[test]
    fn defaults_apply_when_only_the_endpoint_is_configured() {
        let settings = Settings::from_raw(raw_with_endpoint()).expect("valid settings");

        assert_eq!(settings.render.concurrency.get(), 2);
        assert_eq!(settings.render.app_id, "stampa");
        assert_eq!(settings.progress.tick_interval, Duration::from_millis(60));
        assert_eq!(settings.output.directory, PathBuf::from("exports"));
        assert_eq!(settings.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = raw_with_endpoint();
        raw.render.concurrency = Some(4);
        raw.logging.level = Some("info".to_string());

        let overrides = ExportOverrides {
            render_concurrency: Some(8),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        raw.apply_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.render.concurrency.get(), 8);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut raw = raw_with_endpoint();
        raw.render.concurrency = Some(0);
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid {
                key: "render.concurrency",
                ..
            })
        ));
    }

    #[test]
    fn zero_tick_cadence_is_rejected() {
        let mut raw = raw_with_endpoint();
        raw.progress.tick_ms = Some(0);
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid {
                key: "progress.tick_ms",
                ..
            })
        ));
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = raw_with_endpoint();
        let overrides = ExportOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn parse_pages_arguments() {
        let args = CliArgs::parse_from([
            "stampa",
            "pages",
            "--subject",
            "doc-1",
            "--block",
            "front",
            "--block",
            "back",
            "--render-concurrency",
            "3",
        ]);

        match args.command {
            Command::Pages(pages) => {
                assert_eq!(pages.subject, "doc-1");
                assert_eq!(pages.blocks, vec!["front", "back"]);
                assert_eq!(pages.label, "pages");
                assert_eq!(pages.width, 1080);
                assert_eq!(pages.overrides.render_concurrency, Some(3));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_invitations_arguments() {
        let args = CliArgs::parse_from([
            "stampa",
            "invitations",
            "--subject",
            "doc-1",
            "--block",
            "front",
            "--invitee",
            "alice",
            "--invitee",
            "bob",
            "--format",
            "jpg",
        ]);

        match args.command {
            Command::Invitations(invitations) => {
                assert_eq!(invitations.block, "front");
                assert_eq!(invitations.invitees, vec!["alice", "bob"]);
                assert_eq!(invitations.format, "jpg");
                assert_eq!(invitations.label, "invitations");
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
