use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use clap::{ArgAction, Args, Parser as ClapParser, Subcommand as ClapSubcommand};
use eyre::WrapErr;
use pulsewatch_pipeline::{
    IncidentRecorder, PipelineEvent, PipelineHandle, TelemetryBackend, TimeWindow,
    backend::HttpBackend, spawn_from_config,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};

use crate::initializers::{incidents_path, load_config};

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "pulsewatch",
    author = "LambdaClass",
    version,
    about = "Live validator telemetry pipeline"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "config",
        value_name = "CONFIG_FILE",
        help = "TOML configuration file.",
        long_help = "Every field has a default; without a file pulsewatch connects to http://127.0.0.1:8080.",
        env = "PULSEWATCH_CONFIG",
        global = true
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "PULSEWATCH_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error. RUST_LOG directives take precedence.",
        global = true
    )]
    pub log_level: Level,
    #[arg(
        long = "log.color",
        default_value_t = LogColor::Auto,
        help = "Output logs with ANSI color codes.",
        long_help = "Possible values: auto, always, never",
        env = "PULSEWATCH_LOG_COLOR",
        global = true
    )]
    pub log_color: LogColor,
}

/// Overrides applied on top of the configuration file.
#[derive(Args, Debug, Clone, Default)]
pub struct StreamOverrides {
    #[arg(
        long = "base-url",
        value_name = "URL",
        help = "Base URL of the telemetry source.",
        env = "PULSEWATCH_BASE_URL"
    )]
    pub base_url: Option<String>,
    #[arg(
        long = "token-env",
        value_name = "ENV_VAR",
        help = "Environment variable holding the bearer credential.",
        env = "PULSEWATCH_TOKEN_ENV",
        conflicts_with = "no_auth"
    )]
    pub token_env: Option<String>,
    #[arg(
        long = "no-auth",
        action = ArgAction::SetTrue,
        help = "Connect without a bearer credential."
    )]
    pub no_auth: bool,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(name = "run", about = "Follow the live stream and report alert markers")]
    Run {
        #[command(flatten)]
        stream: StreamOverrides,
        #[arg(
            long = "window",
            value_name = "WINDOW",
            value_parser = clap::value_parser!(TimeWindow),
            help = "Initial time window: live or <n>m|h|d."
        )]
        window: Option<TimeWindow>,
        #[arg(
            long = "metrics.interval",
            value_name = "SECONDS",
            default_value_t = 60,
            help = "How often pipeline counters are logged. 0 disables it."
        )]
        metrics_interval: u64,
    },
    #[command(name = "history", about = "Print the last hours of samples as JSON lines")]
    History {
        #[command(flatten)]
        stream: StreamOverrides,
        #[arg(long = "hours", value_name = "HOURS", default_value_t = 1)]
        hours: u32,
    },
    #[command(name = "incidents", about = "Inspect or edit the recorded incident history")]
    Incidents {
        #[arg(
            long = "path",
            value_name = "INCIDENTS_FILE",
            help = "Incident history file; defaults to recorder.incidents_path from the config."
        )]
        path: Option<PathBuf>,
        #[command(subcommand)]
        command: IncidentsCommand,
    },
}

#[derive(ClapSubcommand)]
pub enum IncidentsCommand {
    #[command(name = "list", about = "List recorded incidents, oldest first")]
    List,
    #[command(name = "remove", about = "Remove one incident by its list index")]
    Remove {
        #[arg(value_name = "INDEX")]
        index: usize,
    },
    #[command(name = "clear", about = "Remove every incident")]
    Clear,
}

impl Subcommand {
    pub async fn run(self, opts: &Options) -> eyre::Result<()> {
        match self {
            Subcommand::Run {
                stream,
                window,
                metrics_interval,
            } => {
                let mut config = load_config(opts, &stream)?;
                if let Some(window) = window {
                    config.window.initial = window.to_string();
                }
                let cancel = CancellationToken::new();
                let (handle, events) = spawn_from_config(&config, cancel)?;
                info!(
                    base_url = %config.stream.base_url,
                    window = %config.window.initial,
                    "pulsewatch started"
                );
                follow(handle, events, Duration::from_secs(metrics_interval)).await
            }
            Subcommand::History { stream, hours } => {
                let config = load_config(opts, &stream)?;
                let backend = HttpBackend::new(config.resolver()?, config.request_timeout());
                let samples = backend
                    .history_hours(hours)
                    .await
                    .wrap_err("history query failed")?;
                info!(hours, samples = samples.len(), "history fetched");
                for sample in samples {
                    println!("{}", serde_json::to_string(&sample)?);
                }
                Ok(())
            }
            Subcommand::Incidents { path, command } => {
                let config = load_config(opts, &StreamOverrides::default())?;
                let path = incidents_path(&config, path)?;
                let mut recorder = IncidentRecorder::open(&path, config.cycle_period())?;
                command.run(&mut recorder)
            }
        }
    }
}

impl IncidentsCommand {
    fn run(self, recorder: &mut IncidentRecorder) -> eyre::Result<()> {
        match self {
            IncidentsCommand::List => {
                for (index, incident) in recorder.incidents().iter().enumerate() {
                    println!(
                        "#{index} episode={} at={} loss={} (initial {}) gap {} -> {} detected_in={}ms",
                        incident.episode_id,
                        incident.timestamp.to_rfc3339(),
                        incident.stabilized_loss,
                        incident.initial_loss,
                        incident.baseline_gap,
                        incident.stabilized_gap,
                        incident.detection_duration_ms,
                    );
                }
                println!(
                    "{} incident(s), total stabilized loss {}",
                    recorder.incidents().len(),
                    recorder.total_stabilized_loss()
                );
            }
            IncidentsCommand::Remove { index } => {
                let removed = recorder.remove(index)?;
                println!(
                    "removed #{index} (episode {}). total stabilized loss {}",
                    removed.episode_id,
                    recorder.total_stabilized_loss()
                );
            }
            IncidentsCommand::Clear => {
                let cleared = recorder.reset()?;
                println!("cleared {cleared} incident(s)");
            }
        }
        Ok(())
    }
}

/// Log pipeline events until Ctrl-C or a terminal stream failure.
async fn follow(
    handle: PipelineHandle,
    mut events: mpsc::Receiver<PipelineEvent>,
    metrics_interval: Duration,
) -> eyre::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let period = (!metrics_interval.is_zero()).then_some(metrics_interval);
    let mut ticker = tokio::time::interval(period.unwrap_or(Duration::from_secs(3_600)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, shutting down");
                break Ok(());
            }
            _ = ticker.tick(), if period.is_some() => {
                let metrics = handle.metrics();
                info!(
                    admitted = metrics.samples_admitted,
                    dropped_frames = metrics.frames_dropped,
                    gaps = metrics.gaps_detected,
                    backfills = metrics.backfills_merged,
                    sweeps = metrics.sweeps_run,
                    reconnects = metrics.reconnects,
                    incidents = metrics.incidents_recorded,
                    "pipeline counters"
                );
            }
            event = events.recv() => match event {
                Some(PipelineEvent::Terminal(err)) => {
                    error!(error = %err, "telemetry stream stopped");
                    break Err(eyre::Report::new(err).wrap_err("telemetry stream stopped"));
                }
                Some(event) => log_event(event),
                None => break Err(eyre::eyre!("pipeline stopped unexpectedly")),
            },
        }
    };

    let metrics = handle.metrics();
    handle.shutdown().await;
    debug!("{metrics}");
    outcome
}

fn log_event(event: PipelineEvent) {
    match event {
        PipelineEvent::Connection(status) => {
            info!(state = ?status.state, attempt = status.attempt, "stream connection");
        }
        PipelineEvent::Markers {
            timestamp,
            markers,
            episode_progress,
        } => {
            for marker in markers {
                info!(at = %timestamp, %marker, "alert marker");
            }
            if let Some(progress) = episode_progress {
                debug!(at = %timestamp, progress, "episode detection progress");
            }
        }
        PipelineEvent::IncidentRecorded(incident) => {
            debug!(
                episode_id = incident.episode_id,
                stabilized_loss = incident.stabilized_loss,
                "incident event"
            );
        }
        PipelineEvent::Terminal(err) => warn!(error = %err, "unexpected terminal event"),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum LogColor {
    #[default]
    Auto,
    Always,
    Never,
}

impl Display for LogColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogColor::Auto => write!(f, "auto"),
            LogColor::Always => write!(f, "always"),
            LogColor::Never => write!(f, "never"),
        }
    }
}

impl FromStr for LogColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(LogColor::Auto),
            "always" => Ok(LogColor::Always),
            "never" => Ok(LogColor::Never),
            _ => Err(format!(
                "Invalid log color '{s}'. Expected: auto, always, or never"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        CLI::command().debug_assert();
    }

    #[test]
    fn run_accepts_window_and_overrides() {
        let cli = CLI::try_parse_from([
            "pulsewatch",
            "run",
            "--base-url",
            "http://telemetry.local:9000",
            "--window",
            "6h",
            "--log.level",
            "debug",
        ])
        .expect("valid arguments");

        assert_eq!(cli.opts.log_level, Level::DEBUG);
        let Subcommand::Run { stream, window, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(stream.base_url.as_deref(), Some("http://telemetry.local:9000"));
        assert_eq!(window, Some(TimeWindow::PRESETS[1]));
    }

    #[test]
    fn rejects_unknown_window() {
        assert!(CLI::try_parse_from(["pulsewatch", "run", "--window", "3w"]).is_err());
    }

    #[test]
    fn token_env_conflicts_with_no_auth() {
        assert!(
            CLI::try_parse_from(["pulsewatch", "run", "--token-env", "TOKEN", "--no-auth"])
                .is_err()
        );
    }

    #[test]
    fn incidents_remove_takes_an_index() {
        let cli = CLI::try_parse_from(["pulsewatch", "incidents", "--path", "x.jsonl", "remove", "2"])
            .expect("valid arguments");

        let Subcommand::Incidents { path, command } = cli.command else {
            panic!("expected incidents");
        };
        assert_eq!(path, Some(PathBuf::from("x.jsonl")));
        assert!(matches!(command, IncidentsCommand::Remove { index: 2 }));
    }

    #[test]
    fn log_color_parses_case_insensitively() {
        assert_eq!("ALWAYS".parse::<LogColor>(), Ok(LogColor::Always));
        assert!("sometimes".parse::<LogColor>().is_err());
    }
}
