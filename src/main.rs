//! `lighthouse`: the daemonless broker binary (SPEC_FULL.md §4.9).
//!
//! Exit codes follow §6/§4.9 exactly: 0 normal, 1 config error, 2 storage
//! corruption, 3 clock regression, 4 integrity-key missing.

use clap::{Parser, Subcommand};
use lighthouse_broker::config::BrokerConfig;
use lighthouse_broker::core::broker::Broker;
use lighthouse_broker::core::rpc::{self, RpcRequest};
use lighthouse_broker::trace;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lighthouse", about = "Daemonless coordination broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the broker against a data directory and run until signaled.
    Serve {
        #[arg(long, default_value = ".lighthouse")]
        data_dir: PathBuf,
    },
    /// Scaffold an empty project directory without starting the broker.
    Init {
        #[arg(long, default_value = ".lighthouse")]
        data_dir: PathBuf,
    },
    /// One-shot health check.
    Health {
        #[arg(long, default_value = ".lighthouse")]
        data_dir: PathBuf,
    },
    /// Audit trace export.
    Trace {
        #[command(subcommand)]
        action: TraceAction,
    },
    /// Load and validate configuration only; silent on success.
    ValidateConfig {
        #[arg(long, default_value = ".lighthouse")]
        data_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum TraceAction {
    Export {
        #[arg(long, default_value = ".lighthouse")]
        data_dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli.command) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("lighthouse: {}", err);
            err.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn config_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("lighthouse.toml")
}

fn run(command: Command) -> Result<(), lighthouse_broker::LighthouseError> {
    match command {
        Command::Init { data_dir } => {
            std::fs::create_dir_all(data_dir.join("events"))?;
            std::fs::create_dir_all(data_dir.join("traces"))?;
            let manifest_path = config_path(&data_dir);
            if !manifest_path.exists() {
                let default = BrokerConfig::default();
                let toml_body = toml::to_string_pretty(&default)
                    .map_err(|e| lighthouse_broker::LighthouseError::Codec(e.to_string()))?;
                std::fs::write(&manifest_path, toml_body)?;
            }
            let policy_path = data_dir.join("policy_rules.json");
            if !policy_path.exists() {
                std::fs::write(&policy_path, "[]\n")?;
            }
            println!("initialized lighthouse project at {}", data_dir.display());
            Ok(())
        }
        Command::ValidateConfig { data_dir } => {
            BrokerConfig::load(&config_path(&data_dir))?;
            Ok(())
        }
        Command::Health { data_dir } => {
            let config = BrokerConfig::load(&config_path(&data_dir))?;
            let (broker, recovery) = Broker::open(config)?;
            println!(
                "recovered {} events (truncated_at={:?})",
                recovery.events_recovered, recovery.truncated_at
            );
            let response = rpc::handle(&broker, RpcRequest::Health);
            println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
            Ok(())
        }
        Command::Trace {
            action: TraceAction::Export { data_dir, out },
        } => {
            let config = BrokerConfig::load(&config_path(&data_dir))?;
            let lines = trace::get_last_traces(&config.trace_path(), usize::MAX)?;
            std::fs::write(&out, lines.join("\n"))?;
            println!("exported {} trace lines to {}", lines.len(), out.display());
            Ok(())
        }
        Command::Serve { data_dir } => {
            let config = BrokerConfig::load(&config_path(&data_dir))?;
            let (broker, recovery) = Broker::open(config)?;
            eprintln!(
                "lighthouse: recovered {} events (truncated_at={:?})",
                recovery.events_recovered, recovery.truncated_at
            );

            // Daemonless: this process holds no state a supervisor can't
            // recreate by restarting it against the same data_dir. It runs
            // until killed; the event log's fsync-before-ack discipline
            // means an unclean kill loses nothing durable.
            loop {
                broker.sweep();
                std::thread::sleep(Duration::from_secs(5));
            }
        }
    }
}
