mod oneshot;
mod serve;
mod services;

use anyhow::Result;
use console::style;

use crate::core::config::{ForgeConfig, default_data_dir};
use crate::core::terminal::{self, GuideSection, print_error};
use crate::logging::init_logging;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Daemon")
        .command("serve", "Start the admin API and the daily scheduler")
        .text("  --api-host <host>   --api-port <port>")
        .print();

    GuideSection::new("One-off")
        .command("run", "Run one optimization for an agent in the foreground")
        .text("  --agent <id>   --dry-run   --max-iterations <n>")
        .command("tick", "Run one scheduler pass now")
        .text("  --force (ignore window and cadence)   --agent <id> (with --force)")
        .print();

    GuideSection::new("Environment")
        .status("FORGE_DATA_DIR", "data directory (default ~/.agent-forge)")
        .status("FORGE_ADMIN_TOKEN", "bearer token for the admin API")
        .status("OPENAI_API_KEY", "enables model-backed generation")
        .blank()
        .hint("Settings live in <data dir>/forge.toml; environment wins.")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("forge").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunCommandArgs {
    pub agent: String,
    pub dry_run: bool,
    pub max_iterations: Option<u32>,
}

pub(crate) fn parse_run_command_args(args: &[String], start: usize) -> RunCommandArgs {
    let mut agent = String::new();
    let mut dry_run = false;
    let mut max_iterations = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--agent" | "-a" => {
                if i + 1 < args.len() {
                    agent = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--dry-run" | "-n" => {
                dry_run = true;
                i += 1;
            }
            "--max-iterations" => {
                if i + 1 < args.len() {
                    max_iterations = args[i + 1].parse().ok().filter(|n: &u32| *n > 0);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    RunCommandArgs {
        agent,
        dry_run,
        max_iterations,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TickCommandArgs {
    pub force: bool,
    pub agent: Option<String>,
}

pub(crate) fn parse_tick_command_args(args: &[String], start: usize) -> TickCommandArgs {
    let mut parsed = TickCommandArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--force" | "-f" => {
                parsed.force = true;
                i += 1;
            }
            "--agent" | "-a" => {
                if i + 1 < args.len() {
                    parsed.agent = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    parsed
}

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(api_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "serve" | "daemon" => {
            let log_tx = init_logging(false);
            let mut config = ForgeConfig::load(default_data_dir()).await?;
            let (api_host, api_port) =
                parse_api_server_flags(&args, 2, config.api_host.clone(), config.api_port);
            config.api_host = api_host;
            config.api_port = api_port;
            serve::run_daemon(config, log_tx).await
        }
        "run" => {
            let parsed = parse_run_command_args(&args, 2);
            if parsed.agent.is_empty() {
                print_error("Error: --agent is required for run.");
                print_help();
                return Ok(());
            }
            init_logging(false);
            let config = ForgeConfig::load(default_data_dir()).await?;
            let services = services::build_services(config).await?;
            oneshot::run_once(&services, parsed).await
        }
        "tick" => {
            let parsed = parse_tick_command_args(&args, 2);
            init_logging(false);
            let config = ForgeConfig::load(default_data_dir()).await?;
            let services = services::build_services(config).await?;
            oneshot::tick_once(&services, parsed).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        TickCommandArgs, parse_api_server_flags, parse_run_command_args, parse_tick_command_args,
    };

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn parse_run_command_args_reads_agent_and_flags() {
        let args = argv(&[
            "forge",
            "run",
            "--agent",
            "a-1",
            "--dry-run",
            "--max-iterations",
            "2",
        ]);
        let parsed = parse_run_command_args(&args, 2);
        assert_eq!(parsed.agent, "a-1");
        assert!(parsed.dry_run);
        assert_eq!(parsed.max_iterations, Some(2));
    }

    #[test]
    fn parse_run_command_args_ignores_bad_iteration_counts() {
        let args = argv(&["forge", "run", "-a", "a-1", "--max-iterations", "0"]);
        let parsed = parse_run_command_args(&args, 2);
        assert_eq!(parsed.max_iterations, None);
        assert!(!parsed.dry_run);

        let dangling = argv(&["forge", "run", "--agent"]);
        assert!(parse_run_command_args(&dangling, 2).agent.is_empty());
    }

    #[test]
    fn parse_tick_command_args_reads_force_and_agent() {
        let args = argv(&["forge", "tick", "--force", "--agent", "a-9"]);
        assert_eq!(
            parse_tick_command_args(&args, 2),
            TickCommandArgs {
                force: true,
                agent: Some("a-9".to_string()),
            }
        );
        assert_eq!(
            parse_tick_command_args(&argv(&["forge", "tick"]), 2),
            TickCommandArgs::default()
        );
    }

    #[test]
    fn parse_api_server_flags_reads_host_and_port() {
        let args = argv(&[
            "forge",
            "serve",
            "--api-host",
            "0.0.0.0",
            "--api-port",
            "19000",
        ]);
        let (host, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 17990);
        assert_eq!(host, "0.0.0.0");
        assert_eq!(port, 19000);
    }

    #[test]
    fn parse_api_server_flags_keeps_port_on_garbage() {
        let args = argv(&["forge", "serve", "--api-port", "not-a-port"]);
        let (_, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 17990);
        assert_eq!(port, 17990);
    }
}
