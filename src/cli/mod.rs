mod agent;
mod jobs;
mod serve;
mod tokens;

use std::path::PathBuf;

use anyhow::Result;
use console::style;

use crate::config::Config;
use crate::core::terminal::{GuideSection, print_error, print_warn};

const DEFAULT_CONFIG: &str = "cmdbot.yaml";

fn print_help() {
    GuideSection::new("Run")
        .command("serve", "Run the bot: executor, agent hub and console")
        .command("agent", "Run a remote agent for the configured commands")
        .print();

    GuideSection::new("Manage")
        .command("token create <name>", "Issue an agent registration token")
        .command("token list", "List issued tokens")
        .command("token revoke <id>", "Revoke a token")
        .command("jobs [n]", "Show the most recent jobs")
        .print();

    println!(
        "\n {} {} <command> [--config <path>]\n",
        style("Usage:").bold(),
        style("cmdbot").green()
    );
}

/// Pulls `--config <path>` out of the arguments after `start`. Returns the
/// path, whether it was given explicitly, and the remaining positionals.
pub(crate) fn parse_config_flag(args: &[String], start: usize) -> (PathBuf, bool, Vec<String>) {
    let mut path = PathBuf::from(DEFAULT_CONFIG);
    let mut explicit = false;
    let mut rest = Vec::new();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    path = PathBuf::from(&args[i + 1]);
                    explicit = true;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other => {
                rest.push(other.to_string());
                i += 1;
            }
        }
    }
    (path, explicit, rest)
}

fn load_config(path: &PathBuf, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        print_warn(&format!(
            "No {} found, running with built-in defaults.",
            path.display()
        ));
        return Ok(Config::default());
    }
    Ok(Config::load(path)?)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let cmd = args[1].as_str();
    let (config_path, explicit, rest) = parse_config_flag(&args, 2);
    match cmd {
        "serve" => {
            let config = load_config(&config_path, explicit)?;
            serve::run_serve(config).await
        }
        "agent" => {
            let config = load_config(&config_path, explicit)?;
            agent::run_agent(config).await
        }
        "token" | "tokens" => {
            let config = load_config(&config_path, explicit)?;
            tokens::run_token_command(&config, &rest).await
        }
        "jobs" => {
            let config = load_config(&config_path, explicit)?;
            jobs::run_jobs_command(&config, &rest).await
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
    use super::parse_config_flag;
    use std::path::PathBuf;

    #[test]
    fn parse_config_flag_reads_path_and_positionals() {
        let args = vec![
            "cmdbot".to_string(),
            "token".to_string(),
            "create".to_string(),
            "--config".to_string(),
            "/etc/cmdbot.yaml".to_string(),
            "ci".to_string(),
        ];
        let (path, explicit, rest) = parse_config_flag(&args, 2);
        assert_eq!(path, PathBuf::from("/etc/cmdbot.yaml"));
        assert!(explicit);
        assert_eq!(rest, vec!["create", "ci"]);
    }

    #[test]
    fn parse_config_flag_defaults() {
        let args = vec!["cmdbot".to_string(), "serve".to_string()];
        let (path, explicit, rest) = parse_config_flag(&args, 2);
        assert_eq!(path, PathBuf::from("cmdbot.yaml"));
        assert!(!explicit);
        assert!(rest.is_empty());
    }
}
