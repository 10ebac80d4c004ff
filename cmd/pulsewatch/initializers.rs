use std::io::IsTerminal;
use std::path::PathBuf;

use eyre::WrapErr;
use pulsewatch_pipeline::PipelineConfig;
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, filter::Directive, fmt, prelude::*};

use crate::cli::{LogColor, Options, StreamOverrides};

/// Logs go to stderr so `history` output stays machine readable.
pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let use_color = match opts.log_color {
        LogColor::Always => true,
        LogColor::Never => false,
        LogColor::Auto => std::io::stderr().is_terminal(),
    };

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(include_target)
        .with_ansi(use_color);

    tracing_subscriber::registry()
        .with(log_filter)
        .with(fmt_layer)
        .init();
}

pub fn load_config(opts: &Options, overrides: &StreamOverrides) -> eyre::Result<PipelineConfig> {
    let mut config =
        PipelineConfig::load(opts.config.as_deref()).wrap_err("failed to load configuration")?;
    apply_overrides(&mut config, overrides);
    config.validate()?;
    debug!(config = ?opts.config, base_url = %config.stream.base_url, "configuration loaded");
    Ok(config)
}

fn apply_overrides(config: &mut PipelineConfig, overrides: &StreamOverrides) {
    if let Some(base_url) = &overrides.base_url {
        config.stream.base_url = base_url.clone();
    }
    if overrides.no_auth {
        config.stream.token_env = None;
    } else if let Some(token_env) = &overrides.token_env {
        config.stream.token_env = Some(token_env.clone());
    }
}

/// An explicit `--path` wins over `recorder.incidents_path`.
pub fn incidents_path(config: &PipelineConfig, path: Option<PathBuf>) -> eyre::Result<PathBuf> {
    path.or_else(|| config.recorder.incidents_path.clone())
        .ok_or_else(|| {
            eyre::eyre!("no incident history configured; pass --path or set recorder.incidents_path")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_stream_settings() {
        let mut config = PipelineConfig::default();
        apply_overrides(
            &mut config,
            &StreamOverrides {
                base_url: Some("https://telemetry.example".to_owned()),
                token_env: Some("VALIDATOR_TOKEN".to_owned()),
                no_auth: false,
            },
        );

        assert_eq!(config.stream.base_url, "https://telemetry.example");
        assert_eq!(config.stream.token_env.as_deref(), Some("VALIDATOR_TOKEN"));
    }

    #[test]
    fn no_auth_clears_token_env() {
        let mut config = PipelineConfig::default();
        apply_overrides(
            &mut config,
            &StreamOverrides {
                no_auth: true,
                ..StreamOverrides::default()
            },
        );

        assert_eq!(config.stream.token_env, None);
    }

    #[test]
    fn explicit_incidents_path_wins() {
        let mut config = PipelineConfig::default();
        config.recorder.incidents_path = Some(PathBuf::from("configured.jsonl"));

        assert_eq!(
            incidents_path(&config, Some(PathBuf::from("explicit.jsonl"))).expect("path"),
            PathBuf::from("explicit.jsonl")
        );
        assert_eq!(
            incidents_path(&config, None).expect("path"),
            PathBuf::from("configured.jsonl")
        );
        assert!(incidents_path(&PipelineConfig::default(), None).is_err());
    }
}
