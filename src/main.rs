mod config;
mod metrics;
mod process;
mod signals;
mod watchdog;

use clap::Parser;
use config::SupervisorConfig;
use metrics::PrometheusClient;
use process::ChildCommand;
use signals::ChildSignaller;
use watchdog::{IntervalPacer, Watchdog};

/// Runs a command and watches a Prometheus counter it exports. When the
/// counter stops advancing, the command is sent a hang signal, then a fail
/// signal if it still doesn't recover.
///
/// Settings are read from SUPERVISOR_* environment variables.
#[derive(Parser, Debug)]
#[command(name = "supervisor", version, about)]
pub struct Cli {
    /// Extra environment variable for the subprocess (KEY=VALUE, repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (every metric sample and watchdog decision)
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Command to supervise, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli, |key| std::env::var(key).ok()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            1
        }
    };
    std::process::exit(code);
}

/// Start the subprocess, supervise it, and return the exit code to use.
///
/// Settings are resolved through `lookup` (the process environment in `main`).
async fn run<F>(cli: Cli, lookup: F) -> Result<i32, Box<dyn std::error::Error>>
where
    F: Fn(&str) -> Option<String>,
{
    let config = SupervisorConfig::from_lookup(lookup)?;

    let mut command = match ChildCommand::from_argv(&cli.command) {
        Some(command) => command,
        None if cli.dry_run => ChildCommand::default(),
        None => return Err("too few CLI args, need at least 1 to start the subprocess".into()),
    };
    command.env = cli.env;

    if cli.dry_run {
        print!("{}", config.to_toml());
        if !command.program.is_empty() {
            println!("command = {:?}", command.program);
            println!("args = {:?}", command.args);
        }
        return Ok(0);
    }

    let client = PrometheusClient::new(
        &config.metrics_url,
        &config.metric_name,
        config.fetch_timeout(),
    )?;
    let mut shutdown = signals::listen_for_signals()?;
    let mut child = process::spawn_child(&command)?;
    let pid = child.id().ok_or("subprocess exited before it could be supervised")?;

    let signaller = ChildSignaller::new(pid, config.fail_signal, config.hang_signal);
    let pacer = IntervalPacer::new(config.check_interval(), config.warmup());
    let watchdog = Watchdog::new(config.metric_delta);
    tracing::info!(
        pid,
        metric = %config.metric_name,
        url = %config.metrics_url,
        "watching subprocess progress"
    );
    tokio::spawn(async move {
        watchdog.run(client, signaller, pacer).await;
    });

    Ok(process::wait_child(&mut child, &mut shutdown).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env() -> HashMap<String, String> {
        [
            ("SUPERVISOR_PROMURL", "http://127.0.0.1:1/metrics"),
            ("SUPERVISOR_METRIC", "items_processed_total"),
            ("SUPERVISOR_METRICDELTA", "1"),
            ("SUPERVISOR_WARMUPDURATION", "60"),
            ("SUPERVISOR_CHECKDURATION", "10"),
            ("SUPERVISOR_FAILSIGNAL", "15"),
            ("SUPERVISOR_HANGSIGNAL", "10"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    async fn run_with(args: &[&str], env: &HashMap<String, String>) -> Result<i32, String> {
        let cli = Cli::parse_from(args);
        run(cli, |key| env.get(key).cloned())
            .await
            .map_err(|e| e.to_string())
    }

    #[tokio::test]
    async fn test_run_without_command_is_fatal() {
        let err = run_with(&["supervisor"], &env()).await.unwrap_err();
        assert!(err.contains("too few CLI args"), "{err}");
    }

    #[tokio::test]
    async fn test_run_missing_config_is_fatal_before_spawning() {
        let mut env = env();
        env.remove("SUPERVISOR_METRIC");
        let dir = std::env::temp_dir().join(format!("supervisor-run-{}", std::process::id()));
        let marker = dir.display().to_string();
        let err = run_with(&["supervisor", "mkdir", &marker], &env)
            .await
            .unwrap_err();
        assert!(err.contains("SUPERVISOR_METRIC"), "{err}");
        assert!(!dir.exists(), "subprocess must not be started");
    }

    #[tokio::test]
    async fn test_run_dry_run_does_not_spawn() {
        let dir = std::env::temp_dir().join(format!("supervisor-dry-{}", std::process::id()));
        let marker = dir.display().to_string();
        let code = run_with(&["supervisor", "--dry-run", "mkdir", &marker], &env())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(!dir.exists(), "dry run must not start the subprocess");
    }

    #[tokio::test]
    async fn test_run_dry_run_without_command() {
        assert_eq!(run_with(&["supervisor", "--dry-run"], &env()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_spawn_failure_is_fatal() {
        let err = run_with(&["supervisor", "nonexistent-binary-xyz"], &env())
            .await
            .unwrap_err();
        assert!(err.contains("failed to start subprocess"), "{err}");
    }

    #[tokio::test]
    async fn test_run_propagates_child_exit_code() {
        let code = run_with(&["supervisor", "sh", "-c", "exit 42"], &env())
            .await
            .unwrap();
        assert_eq!(code, 42);
    }

    #[test]
    fn test_cli_trailing_command_keeps_its_flags() {
        let cli = Cli::parse_from(["supervisor", "-v", "engine", "--threads", "4", "-q"]);
        assert!(cli.verbose);
        assert!(!cli.quiet);
        assert_eq!(cli.command, vec!["engine", "--threads", "4", "-q"]);
    }

    #[test]
    fn test_cli_env_pairs() {
        let cli = Cli::parse_from(["supervisor", "-e", "A=1", "--env", "B=x=y", "engine"]);
        assert_eq!(
            cli.env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
        assert_eq!(cli.command, vec!["engine"]);
    }

    #[test]
    fn test_cli_rejects_malformed_env_pair() {
        assert!(Cli::try_parse_from(["supervisor", "-e", "NOVALUE", "engine"]).is_err());
        assert!(Cli::try_parse_from(["supervisor", "-e", "=1", "engine"]).is_err());
    }

    #[test]
    fn test_cli_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["supervisor", "-v", "-q", "engine"]).is_err());
    }

    #[test]
    fn test_cli_without_command_parses_empty() {
        let cli = Cli::parse_from(["supervisor", "--dry-run"]);
        assert!(cli.dry_run);
        assert!(cli.command.is_empty());
    }
}
