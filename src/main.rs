//! stampede - distributed load-test control plane

mod cli;

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde::Serialize;
use stampede::agent::{AgentClient, AgentProcess, Message, TestCase, TestSuite};
use stampede::logging::{self, LogConfig};
use stampede::worker::run_worker_main;

use cli::{AgentArgs, Cli, Commands, SendArgs, SendCommand};

fn main() {
    let cli = Cli::parse();

    let preset = match &cli.command {
        Commands::Agent(_) => LogConfig::for_agent(),
        Commands::Worker(_) => LogConfig::for_worker(),
        Commands::Send(_) => LogConfig::for_client(),
    };
    logging::init(log_config(&cli, preset));

    let result = match &cli.command {
        Commands::Agent(args) => cmd_agent(args),
        Commands::Worker(args) => {
            if !args.rest.is_empty() {
                tracing::debug!(args = ?args.rest, "Ignoring extra worker arguments");
            }
            run_worker_main(&args.id, &args.role)
        }
        Commands::Send(args) => cmd_send(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Environment first, then command-line flags.
fn log_config(cli: &Cli, preset: LogConfig) -> LogConfig {
    let mut config = preset.with_env_overrides();
    if let Some(level) = cli.log_level(config.level) {
        config = config.with_level(level);
        // An explicit -v/-q beats a filter inherited from the environment.
        config.filter = None;
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    config
}

fn cmd_agent(args: &AgentArgs) -> Result<()> {
    let config = args.to_config();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        eprintln!("\nReceived shutdown signal, stopping agent...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let process = AgentProcess::start(&config, shutdown).context("failed to start agent")?;

    // First stdout line is the bound address; launch scripts read it.
    let addr = process.local_addr()?;
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", addr)?;
    stdout.flush()?;

    process.run().context("agent stopped with an error")?;
    Ok(())
}

fn cmd_send(args: &SendArgs) -> Result<()> {
    let client = AgentClient::new(&args.agent).with_timeout(Duration::from_secs(args.timeout));
    let context = || format!("command to agent at {} failed", client.addr());

    match &args.command {
        SendCommand::Echo { text } => {
            client.echo(text.as_str()).with_context(context)?;
            println!("ok");
        }
        SendCommand::Spawn(spawn) => {
            client.spawn_workers(spawn.to_settings()).with_context(context)?;
            println!("ok");
        }
        SendCommand::List => {
            for id in client.list_workers().with_context(context)? {
                println!("{}", id);
            }
        }
        SendCommand::ExecuteAll { command } => {
            let outcomes = client.execute_all(command.clone()).with_context(context)?;
            print_json(&outcomes)?;
            let failed = outcomes.iter().filter(|o| !o.is_success()).count();
            if failed > 0 {
                bail!("{} of {} workers failed", failed, outcomes.len());
            }
        }
        SendCommand::ExecuteOne { worker_id, command } => {
            let value = client
                .execute_one(worker_id.as_str(), command.clone())
                .with_context(context)?;
            print_json(&value)?;
        }
        SendCommand::Terminate => {
            client.terminate_all().with_context(context)?;
            println!("ok");
        }
        SendCommand::Failures => {
            print_json(&client.get_failures().with_context(context)?)?;
        }
        SendCommand::InitSuite { id, tests } => {
            let suite = TestSuite {
                id: id.clone(),
                tests: tests
                    .iter()
                    .map(|test| TestCase {
                        id: test.clone(),
                        ..TestCase::default()
                    })
                    .collect(),
            };
            client.init_test_suite(suite).with_context(context)?;
            println!("ok");
        }
        SendCommand::Message {
            kind,
            address,
            payload,
        } => {
            let message = Message {
                address: address.clone(),
                kind: kind.clone(),
                payload: payload.clone(),
            };
            client.submit_message(message).with_context(context)?;
            println!("ok");
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
