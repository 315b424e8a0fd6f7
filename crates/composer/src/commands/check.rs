//! Check command - validate the configuration and print it.

use anyhow::Result;
use clap::Args;
use composer_core::{ServerSpec, TransportKind};

use super::Context;

/// Arguments for the check command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Print the effective configuration as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the check command. Loading already validated the config, so
/// reaching this point means it is usable.
pub async fn run(args: CheckArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    if args.json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    match &ctx.source {
        Some(path) => println!("Config: {}", path.display()),
        None => println!("Config: none found, using defaults"),
    }
    println!("Aggregate: {} (streaming on {})", config.composer.name, config.streaming.bind);

    println!();
    println!("Servers ({}):", config.servers.len());
    for server in &config.servers {
        println!("  {}", describe(server));
        if ctx.verbose {
            println!(
                "      restart: {:?} (max {}), health: {}, readiness: {:?}",
                server.restart.policy,
                server.restart.max_restarts,
                if server.health.enabled { "on" } else { "off" },
                server.readiness,
            );
        }
    }

    let registry = &config.registry;
    println!();
    println!("Conflict strategy: {}", registry.strategy);
    for o in &registry.overrides {
        println!("  override {} -> {}", o.pattern, o.strategy);
    }
    if registry.versioning.enabled {
        println!("  versioning: {}", registry.versioning.suffix_format);
    }
    for alias in &registry.aliases {
        println!("  alias {} -> {}", alias.alias, alias.target);
    }

    if !config.translators.is_empty() {
        println!();
        println!("Translators ({}):", config.translators.len());
        for translator in &config.translators {
            println!("  {} ({})", translator.name(), translator.direction());
        }
    }

    println!();
    println!("Configuration OK");
    Ok(())
}

fn describe(server: &ServerSpec) -> String {
    let target = match server.transport {
        TransportKind::Stdio => {
            let mut line = server.command.clone();
            for arg in &server.args {
                line.push(' ');
                line.push_str(arg);
            }
            line
        }
        TransportKind::Streaming => server.url.clone().unwrap_or_default(),
    };
    let disabled = if server.enabled { "" } else { " [disabled]" };
    format!("{} [{}] {}{}", server.name, server.transport, target, disabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let spec = ServerSpec::new("git", "mcp-git").with_arg("--repo").with_arg(".");
        assert_eq!(describe(&spec), "git [stdio] mcp-git --repo .");

        let mut remote = ServerSpec::remote("search", "http://localhost:7000/sse");
        remote.enabled = false;
        assert_eq!(
            describe(&remote),
            "search [streaming] http://localhost:7000/sse [disabled]"
        );
    }
}
