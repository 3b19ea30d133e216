//! Privilege-escalation agent CLI.
//!
//! `privesc run` drives the reasoner against the configured target until the
//! session runs as the target user or the turn budget is spent. `exec` and
//! `check-root` exercise the channel and the root detector on their own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use privesc::agent::{Agent, AgentSettings, RunStop, TurnReport};
use privesc::capabilities::{CapabilityDispatcher, DispatchOutcome, RunCommand, TestCredential};
use privesc::core::root_detect::RootDetector;
use privesc::core::text::last_non_empty_line;
use privesc::exit_codes;
use privesc::io::config::{DEFAULT_CONFIG_PATH, PrivescConfig, load_config, write_config};
use privesc::io::hints::resolve_hint;
use privesc::io::reasoner::CommandReasoner;
use privesc::io::session::Session;
use privesc::logging;

#[derive(Parser)]
#[command(
    name = "privesc",
    version,
    about = "Autonomous privilege-escalation agent over an interactive shell"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the agent until root or the turn budget is spent.
    Run {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Override `agent.max_turns`.
        #[arg(long)]
        max_turns: Option<u32>,
        /// Override `agent.hints` (`hint:<text>` or a JSON file path).
        #[arg(long)]
        hints: Option<String>,
    },
    /// Run one framed command on the target and print its output.
    Exec {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Override `channel.timeout_secs`.
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Evaluate the root detector on one output line.
    CheckRoot {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        #[arg(long)]
        host: String,
        line: String,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { config, force } => cmd_init(&config, force),
        Command::Run {
            config,
            max_turns,
            hints,
        } => cmd_run(&config, max_turns, hints),
        Command::Exec {
            config,
            timeout_secs,
            command,
        } => cmd_exec(&config, timeout_secs, &command.join(" ")),
        Command::CheckRoot { config, host, line } => cmd_check_root(&config, &host, &line),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &PrivescConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(path: &Path, max_turns: Option<u32>, hints: Option<String>) -> Result<i32> {
    let mut config = load_config(path)?;
    if let Some(max_turns) = max_turns {
        config.agent.max_turns = max_turns;
    }
    if hints.is_some() {
        config.agent.hints = hints;
    }
    config.validate()?;

    let hint = resolve_hint(config.agent.hints.as_deref(), &config.target.hostname);
    let detector = config.root_detection.detector()?;
    let mut dispatcher = CapabilityDispatcher::new(
        Session::from_config(&config),
        Box::new(detector),
        config.target.target_user.clone(),
    );
    dispatcher.register(RunCommand::new(), true)?;
    dispatcher.register(TestCredential::new(), false)?;

    let reasoner = CommandReasoner::new(&config.reasoner);
    let mut agent = Agent::new(
        dispatcher,
        reasoner,
        AgentSettings::from_config(&config, hint),
    )?;
    let outcome = agent.run(print_turn)?;
    if let Some(run_id) = &outcome.run_id {
        info!(run_id = %run_id, "run artifacts written");
    }

    match outcome.stop {
        RunStop::GotRoot { turn, command } => {
            println!("got root in turn {turn} with: {command}");
            Ok(exit_codes::OK)
        }
        RunStop::Exhausted { max_turns } => {
            println!("maximum turn number reached ({max_turns}) without root");
            Ok(exit_codes::EXHAUSTED)
        }
    }
}

fn print_turn(report: &TurnReport) {
    for executed in &report.commands {
        match &executed.outcome {
            DispatchOutcome::Rejected { reason } => {
                println!("[{}] {} -> rejected: {reason}", report.turn, executed.command);
            }
            DispatchOutcome::Executed {
                capability,
                got_root,
                duration,
                ..
            } => {
                println!(
                    "[{}] {capability}: {} ({:.1}s{})",
                    report.turn,
                    executed.command,
                    duration.as_secs_f64(),
                    if *got_root { ", root" } else { "" }
                );
            }
        }
    }
}

fn cmd_exec(path: &Path, timeout_secs: Option<u64>, command: &str) -> Result<i32> {
    let config = load_config(path)?;
    let mut session = Session::from_config(&config);
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.channel.timeout());
    let result = session
        .run_with_timeout(command, timeout)
        .with_context(|| format!("run {command:?}"))?;
    session.close()?;

    if !result.stdout.is_empty() {
        println!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr);
    }
    eprintln!("return code: {}", result.return_code);
    if result.succeeded() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::FAILED)
    }
}

fn cmd_check_root(path: &Path, host: &str, line: &str) -> Result<i32> {
    let config = load_config(path)?;
    let detector = config.root_detection.detector()?;
    let got_root = detector.got_root(host, &last_non_empty_line(line));
    println!("{got_root}");
    Ok(if got_root {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}
