use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};

use hookline_core::app::{
    CaptureInput, Enqueuer, ManualRetry, RetrySelection, WorkerSettings, manual_retry, run_worker,
    worker_lock,
};
use hookline_core::config::{Config, ConfigResolver};
use hookline_core::domain::{EventId, EventKind};
use hookline_core::impls::ProcessLauncher;
use hookline_core::observability::init_tracing;
use hookline_core::paths::DataPaths;
use hookline_core::ports::{EventStore, SystemClock, UlidGenerator, WorkerLauncher};
use hookline_core::queue::FileEventStore;

fn usage() -> &'static str {
    "hookline - durable delivery of captured host events\n\n\
USAGE:\n\
  hookline capture <kind>                  read {session_id, payload} JSON from stdin\n\
  hookline worker                          deliver until the queue is drained\n\
  hookline kick                            make sure a worker is running\n\
  hookline retry-failed [--list] [--all | ID...]\n\n\
FLAGS:\n\
  --data-dir DIR          default $HOME/.hookline\n\
  --config FILE           default <data-dir>/config.json\n\
  --bundled-config FILE   lowest-priority config file\n\n\
KINDS:\n\
  user_message assistant_message tool_attempt bash_result session_start\n"
}

#[derive(Debug, PartialEq)]
enum Command {
    Capture(String),
    Worker,
    Kick,
    RetryFailed {
        list: bool,
        selection: Option<RetrySelection>,
    },
}

#[derive(Debug)]
struct CliArgs {
    command: Command,
    data_dir: PathBuf,
    config: Option<PathBuf>,
    bundled_config: Option<PathBuf>,
}

impl CliArgs {
    fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_dir)
    }

    fn resolve_config(&self, paths: &DataPaths) -> Config {
        let user = self.config.clone().unwrap_or_else(|| paths.user_config.clone());
        ConfigResolver::standard(user, self.bundled_config.clone()).resolve()
    }

    /// Arguments for a detached `hookline worker` on the same data directory.
    fn worker_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "worker".into(),
            "--data-dir".into(),
            self.data_dir.clone().into(),
        ];
        if let Some(config) = &self.config {
            args.push("--config".into());
            args.push(config.clone().into());
        }
        if let Some(bundled) = &self.bundled_config {
            args.push("--bundled-config".into());
            args.push(bundled.clone().into());
        }
        args
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs, String> {
    let mut args = args.into_iter();
    let mut command_name: Option<String> = None;
    let mut positional = Vec::new();
    let mut data_dir = None;
    let mut config = None;
    let mut bundled_config = None;
    let mut list = false;
    let mut all = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => data_dir = Some(PathBuf::from(flag_value(&mut args, &arg)?)),
            "--config" => config = Some(PathBuf::from(flag_value(&mut args, &arg)?)),
            "--bundled-config" => {
                bundled_config = Some(PathBuf::from(flag_value(&mut args, &arg)?))
            }
            "--list" => list = true,
            "--all" => all = true,
            "-h" | "--help" => return Err(String::new()),
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}")),
            _ if command_name.is_none() => command_name = Some(arg),
            _ => positional.push(arg),
        }
    }

    let command = match command_name.as_deref() {
        Some("capture") => match positional.as_slice() {
            [kind] => Command::Capture(kind.clone()),
            _ => return Err("capture takes exactly one <kind>".into()),
        },
        Some("worker") if positional.is_empty() => Command::Worker,
        Some("kick") if positional.is_empty() => Command::Kick,
        Some("retry-failed") => {
            if all && !positional.is_empty() {
                return Err("--all cannot be combined with ids".into());
            }
            let selection = if all {
                Some(RetrySelection::All)
            } else if positional.is_empty() {
                None
            } else {
                let ids = positional
                    .iter()
                    .map(|raw| raw.parse::<EventId>().map_err(|e| e.to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(RetrySelection::Ids(ids))
            };
            if selection.is_none() && !list {
                return Err("retry-failed needs --list, --all or event ids".into());
            }
            Command::RetryFailed { list, selection }
        }
        Some(other) => return Err(format!("unexpected arguments for {other}")),
        None => return Err("missing command".into()),
    };

    Ok(CliArgs {
        command,
        data_dir: data_dir.unwrap_or_else(DataPaths::default_root),
        config,
        bundled_config,
    })
}

fn flag_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| format!("{flag} needs a value"))
}

fn open_store(paths: &DataPaths) -> Result<Arc<dyn EventStore>, String> {
    FileEventStore::open(paths.clone(), Arc::new(SystemClock))
        .map(|store| Arc::new(store) as Arc<dyn EventStore>)
        .map_err(|e| e.to_string())
}

fn launcher(cli: &CliArgs, paths: &DataPaths, config: &Config) -> Result<ProcessLauncher, String> {
    ProcessLauncher::current_exe(cli.worker_args(), worker_lock(paths, config))
        .map_err(|e| e.to_string())
}

/// Hook entry point. Whatever happens, the host sees a silent success.
fn capture(cli: &CliArgs, kind: &str) -> ExitCode {
    let paths = cli.paths();
    let _log = init_tracing(&paths.log_dir, "capture.log");

    if let Err(e) = try_capture(cli, &paths, kind) {
        error!(kind, error = %e, "capture dropped");
    }
    ExitCode::SUCCESS
}

fn try_capture(cli: &CliArgs, paths: &DataPaths, kind: &str) -> Result<(), String> {
    let kind: EventKind = kind.parse().map_err(|e| format!("{e}"))?;

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .map_err(|e| format!("cannot read stdin: {e}"))?;
    let input: CaptureInput =
        serde_json::from_str(&raw).map_err(|e| format!("invalid input JSON: {e}"))?;

    let config = cli.resolve_config(paths);
    let enqueuer = Enqueuer::new(
        open_store(paths)?,
        Arc::new(launcher(cli, paths, &config)?),
        Arc::new(UlidGenerator::new(SystemClock)),
        Arc::new(SystemClock),
    );
    enqueuer.capture_or_log(kind, input);
    Ok(())
}

fn worker(cli: &CliArgs) -> ExitCode {
    let paths = cli.paths();
    let _log = init_tracing(&paths.log_dir, "worker.log");
    let config = cli.resolve_config(&paths);
    let settings = WorkerSettings::from_config(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_worker(&paths, &config, settings)) {
        Ok(Some(report)) => {
            info!(
                delivered = report.delivered,
                retried = report.retried,
                failed = report.failed,
                recovered = report.recovered,
                "worker exited"
            );
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "worker stopped");
            ExitCode::FAILURE
        }
    }
}

fn kick(cli: &CliArgs) -> Result<(), String> {
    let paths = cli.paths();
    let config = cli.resolve_config(&paths);
    let outcome = launcher(cli, &paths, &config)?
        .ensure_running()
        .map_err(|e| e.to_string())?;
    println!("{outcome:?}");
    Ok(())
}

fn retry_failed(cli: &CliArgs, list: bool, selection: Option<&RetrySelection>) -> Result<(), String> {
    let paths = cli.paths();
    let _log = init_tracing(&paths.log_dir, "retry.log");
    let retry = ManualRetry::new(open_store(&paths)?);

    if list {
        let failed = retry.list().map_err(|e| e.to_string())?;
        for record in &failed {
            println!("{}", manual_retry::describe(record));
        }
        if failed.is_empty() {
            println!("no failed records");
        }
    }

    let Some(selection) = selection else {
        return Ok(());
    };
    let reset = retry.reset(selection).map_err(|e| e.to_string())?;
    println!("reset {} record(s) to pending", reset.len());

    if !reset.is_empty() {
        let config = cli.resolve_config(&paths);
        let started = launcher(cli, &paths, &config)
            .and_then(|l| l.ensure_running().map_err(|e| e.to_string()));
        if let Err(e) = started {
            warn!(error = %e, "could not start a worker, records stay pending");
            eprintln!("warning: could not start a worker: {e}");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let is_capture = raw.first().is_some_and(|a| a == "capture");

    let cli = match parse_args(raw) {
        Ok(cli) => cli,
        // hooks never fail the host, not even on bad arguments
        Err(_) if is_capture => return ExitCode::SUCCESS,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("error: {message}\n");
            }
            eprint!("{}", usage());
            return ExitCode::from(2);
        }
    };

    let result = match &cli.command {
        Command::Capture(kind) => return capture(&cli, kind),
        Command::Worker => return worker(&cli),
        Command::Kick => kick(&cli),
        Command::RetryFailed { list, selection } => retry_failed(&cli, *list, selection.as_ref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
