//! depguard - dependency-resilience layer
//!
//! Serves health, admin and auth-protected routes in front of a set of
//! guarded dependencies.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use depguard::{
    cli::{BuildUrlArgs, Cli, Command},
    config::{Config, resolve_secret},
    connection::{ConnectionSpec, ConnectionStringBuilder},
    gateway::Server,
    resolver::Resolver,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Resolve { ref name }) => run_resolve(&cli, name).await,
        Some(Command::BuildUrl(ref args)) => run_build_url(args),
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    Config::load_validated(cli.config.as_deref()).context("Failed to load configuration")
}

/// Load + validate, then print every target with credentials masked
fn run_check_config(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let targets = config.connection_targets()?;

    println!("✅ Configuration valid");
    println!("   Listen: {}:{}", config.server.host, config.server.port);
    println!("   Dependencies: {}", targets.len());
    for (name, target) in &targets {
        let dep = &config.dependencies[name];
        println!(
            "   • {name} ({}){}: {}",
            dep.kind,
            if dep.critical { " [critical]" } else { "" },
            target.redacted()
        );
    }
    if config.auth.enabled {
        println!(
            "   Auth: authority={} cache={:?} policy={:?}",
            config.auth.authority, config.auth.cache, config.auth.failure_policy
        );
    } else {
        println!("   Auth: disabled");
    }
    Ok(())
}

/// One resolution through the configured resolver
async fn run_resolve(cli: &Cli, name: &str) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let resolver = Resolver::from_config(&config.resolver)?;
    let endpoint = resolver
        .resolve(name)
        .await
        .with_context(|| format!("Could not resolve '{name}'"))?;

    println!("{}", endpoint.logical_name);
    println!("   Source: {}", endpoint.source);
    for addr in &endpoint.addresses {
        println!("   Address: {addr}");
    }
    Ok(())
}

/// Run the connection-string builder on flags
fn run_build_url(args: &BuildUrlArgs) -> anyhow::Result<()> {
    let spec = ConnectionSpec {
        kind: args.kind.into(),
        connection_string: args.connection_string.clone(),
        host: args.host.clone(),
        port: args.port,
        username: args.username.clone(),
        credential: args.credential.as_deref().map(resolve_secret).transpose()?,
        path: args.path.clone(),
        tls_enabled: args.tls,
    };
    let target = ConnectionStringBuilder::build(&spec)?;

    if args.show_secret {
        println!("{}", target.connection_string());
    } else {
        println!("{}", target.redacted());
    }
    Ok(())
}

async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        dependencies = config.dependencies.len(),
        "Starting depguard"
    );

    let server = Server::new(config, cli.config.clone()).context("Failed to initialize resilience layer")?;
    server.run().await.context("Server error")?;
    Ok(())
}
