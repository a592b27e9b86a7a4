//! Command-line interface
//!
//! `portico serve` runs the gateway; the `instances` subcommands are
//! small operational helpers against the backing store.

use crate::config::{Config, HttpConfig};
use crate::engine::Engine;
use crate::sessions::HttpProxyHandler;
use crate::storage::create_store_from_config;
use crate::{GatewayError, Result};
use clap::{Arg, ArgMatches, Command};
use std::sync::Arc;
use uuid::Uuid;

/// Main CLI entry point
pub async fn run() -> Result<()> {
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("serve", sub)) => serve_command(sub).await,
        Some(("instances", sub)) => instances_command(sub).await,
        _ => {
            eprintln!("No command specified. Use --help for usage information.");
            std::process::exit(1);
        }
    }
}

fn build_cli() -> Command {
    Command::new("portico")
        .about("Portico - multi-tenant MCP credential gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand(
            Command::new("serve")
                .about("Start the gateway server")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .short('c')
                        .help("Path to config file (default: portico.config.json)"),
                )
                .arg(Arg::new("host").long("host").help("Bind address override"))
                .arg(
                    Arg::new("port")
                        .long("port")
                        .short('p')
                        .help("Bind port override"),
                ),
        )
        .subcommand(
            Command::new("instances")
                .about("Inspect and manage stored instances")
                .subcommand(Command::new("list").about("List all instances").arg(
                    Arg::new("config").long("config").short('c').help("Path to config file"),
                ))
                .subcommand(
                    Command::new("delete")
                        .about("Delete an instance")
                        .arg(Arg::new("id").required(true).help("Instance UUID"))
                        .arg(
                            Arg::new("config")
                                .long("config")
                                .short('c')
                                .help("Path to config file"),
                        ),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    let config = match matches.get_one::<String>("config") {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }?;
    crate::init_logging(config.log.as_ref().and_then(|l| l.level.as_deref()));
    Ok(config)
}

async fn serve_command(matches: &ArgMatches) -> Result<()> {
    let mut config = load_config(matches)?;

    if let Some(host) = matches.get_one::<String>("host") {
        config.http.get_or_insert_with(HttpConfig::default).host = host.clone();
    }
    if let Some(port) = matches.get_one::<String>("port") {
        let port = port
            .parse()
            .map_err(|_| GatewayError::config(format!("invalid port '{}'", port)))?;
        config.http.get_or_insert_with(HttpConfig::default).port = port;
    }

    let engine = Arc::new(Engine::new(config.clone(), HttpProxyHandler::factory()).await?);
    crate::http::serve(config, engine).await
}

async fn instances_command(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("list", sub)) => {
            let config = load_config(sub)?;
            let store = create_store_from_config(&config.storage).await?;
            let instances = store.list_instances().await?;
            // Identifying fields only; never print stored secrets
            let rows: Vec<_> = instances
                .iter()
                .map(|i| {
                    serde_json::json!({
                        "instanceId": i.instance_id,
                        "service": i.service_name,
                        "userId": i.user_id,
                        "status": i.status,
                        "oauthStatus": i.oauth_status,
                        "tokenExpiresAt": i.token_expires_at,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Some(("delete", sub)) => {
            let config = load_config(sub)?;
            let id = sub
                .get_one::<String>("id")
                .expect("required arg");
            let id = Uuid::parse_str(id)
                .map_err(|_| GatewayError::config(format!("'{}' is not a valid UUID", id)))?;
            let store = create_store_from_config(&config.storage).await?;
            store.delete_instance(id).await?;
            println!("deleted {}", id);
            Ok(())
        }
        _ => {
            eprintln!("Usage: portico instances <list|delete>");
            std::process::exit(1);
        }
    }
}
