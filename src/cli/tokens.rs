use anyhow::Result;
use console::style;

use crate::config::Config;
use crate::core::store::Store;
use crate::core::terminal::{print_error, print_secret, print_success};
use crate::core::tokens::TokenLedger;

pub async fn run_token_command(config: &Config, args: &[String]) -> Result<()> {
    let sub_cmd = args.first().map(String::as_str).unwrap_or("");
    let tokens = TokenLedger::new(Store::open(&config.database));

    match sub_cmd {
        "create" => {
            let Some(name) = args.get(1) else {
                println!("{}", style("Usage: cmdbot token create <name>").bold());
                return Ok(());
            };
            let (raw, record) = tokens.create(name).await?;
            println!();
            print_success(&format!("Agent token '{}' created (id {}).", record.name, record.id));
            print_secret("Token", &raw);
            println!(
                "\n  {} Save this token now, it will not be shown again.",
                style("⚠").yellow()
            );
            println!(
                "  {} Put it under agent.token in the agent's config.\n",
                style("→").cyan()
            );
        }
        "list" | "ls" => {
            let list = tokens.list().await?;
            if list.is_empty() {
                println!(
                    "  {} No agent tokens. Agent registration is open.",
                    style("●").dim()
                );
                return Ok(());
            }
            println!("\n  {} Agent tokens:\n", style("●").cyan());
            for record in &list {
                println!(
                    "    {}  {}  {}",
                    style(&record.id).bold(),
                    record.name,
                    style(record.created_at.format("%Y-%m-%d %H:%M")).dim()
                );
            }
            println!();
        }
        "revoke" | "rm" => {
            let Some(id) = args.get(1) else {
                println!("{}", style("Usage: cmdbot token revoke <id>").bold());
                return Ok(());
            };
            if tokens.revoke(id).await? {
                print_success(&format!("Token {} revoked.", id));
            } else {
                print_error(&format!("No token with id {}", id));
            }
        }
        _ => {
            println!(
                "{}",
                style("Usage: cmdbot token <create <name> | list | revoke <id>>").bold()
            );
        }
    }
    Ok(())
}
