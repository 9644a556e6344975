#![deny(unsafe_code)]

//! onionctl CLI — run a Tor controller or talk to a running one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use onionctl_config::AppConfig;
use onionctl_core::ipc::server::socket_path_from_config;
use onionctl_core::ipc::{FetchRequest, FetchResponse, IpcClient, LifecycleResponse};
use onionctl_core::{ControlFacade, ControlService, build_info};

/// onionctl — supervise a Tor daemon and fetch through it.
#[derive(Parser)]
#[command(name = "onionctl", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "onionctl.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print controller responses as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller and serve IPC until Ctrl-C or `shutdown`.
    Run {
        /// Start Tor immediately instead of waiting for `start`.
        #[arg(long)]
        start: bool,
    },

    /// Show controller and daemon status.
    Status,

    /// Start Tor in the running controller.
    Start,

    /// Stop Tor in the running controller.
    Stop,

    /// Restart Tor in the running controller.
    Restart,

    /// Fetch a URL through Tor.
    Fetch {
        url: String,

        /// HTTP method.
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header as `Name: value`. Repeatable.
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body.
        #[arg(short, long)]
        data: Option<String>,

        /// End-to-end request timeout.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Route through a running controller instead of launching Tor.
        #[arg(long)]
        via_controller: bool,
    },

    /// Stop a running controller.
    Shutdown,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let filter = match cli.verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = || IpcClient::new(socket_path_from_config(&config));

    match cli.command {
        Commands::Run { start } => cmd_run(config, start).await?,
        Commands::Status => cmd_status(&client(), cli.json).await?,
        Commands::Start => print_lifecycle(client().start().await?, cli.json)?,
        Commands::Stop => print_lifecycle(client().stop().await?, cli.json)?,
        Commands::Restart => print_lifecycle(client().restart().await?, cli.json)?,
        Commands::Fetch {
            url,
            method,
            headers,
            data,
            timeout_ms,
            via_controller,
        } => {
            let req = FetchRequest {
                method,
                url,
                headers: parse_headers(&headers)?,
                body: data,
                timeout_ms,
            };
            let resp = if via_controller {
                client().fetch(&req).await?
            } else {
                fetch_once(&config, &req).await?
            };
            print_fetch(&resp, cli.json)?;
        }
        Commands::Shutdown => {
            let resp = client().shutdown().await?;
            println!("{}", resp.message);
        }
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

async fn cmd_run(config: AppConfig, start: bool) -> Result<()> {
    info!(version = %build_info::version_string(), "Starting onionctl controller");
    let service = ControlService::new(config);
    service.run(start).await?;
    Ok(())
}

async fn cmd_status(client: &IpcClient, json: bool) -> Result<()> {
    let status = client.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("state:    {}", status.state);
    if let Some(port) = status.socks_port {
        println!("socks:    127.0.0.1:{port}");
    }
    if let Some(alive) = status.daemon_alive {
        println!("process:  {}", if alive { "running" } else { "not running" });
    }
    println!("backend:  {}", status.backend);
    println!("pid:      {}", status.pid);
    println!("uptime:   {}s", status.uptime_secs);
    println!("version:  {} ({})", status.version, status.git_hash);
    Ok(())
}

fn print_lifecycle(resp: LifecycleResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&resp)?);
    } else {
        println!("{}", resp.state);
    }
    Ok(())
}

fn print_fetch(resp: &FetchResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(resp)?);
        return Ok(());
    }
    eprintln!("HTTP {} ({} ms)", resp.status, resp.elapsed_ms);
    println!("{}", resp.body);
    Ok(())
}

/// Launch Tor, send one request, and stop Tor again.
async fn fetch_once(config: &AppConfig, req: &FetchRequest) -> Result<FetchResponse> {
    let proxied = req.to_proxy_request()?;

    let facade = ControlFacade::new(config);
    let port = facade.start().await.context("Tor failed to start")?;
    info!(socks_port = port, "Tor ready");

    let result = facade.fetch(proxied).await;
    facade.stop().await.context("Tor did not stop cleanly")?;
    Ok(FetchResponse::from(&result?))
}

fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|h| match h.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok((name.trim().to_string(), value.trim().to_string()))
            }
            _ => bail!("header must be `Name: value`, got {h:?}"),
        })
        .collect()
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path).await.map_err(|e| anyhow::anyhow!(e))
    } else {
        Ok(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(&[
            "Authorization: Bearer abc".to_string(),
            "X-Empty:".to_string(),
        ])
        .unwrap();
        assert_eq!(
            headers,
            vec![
                ("Authorization".to_string(), "Bearer abc".to_string()),
                ("X-Empty".to_string(), String::new()),
            ]
        );
        assert!(parse_headers(&["no-colon".to_string()]).is_err());
        assert!(parse_headers(&[": value".to_string()]).is_err());
    }

    #[test]
    fn test_fetch_args() {
        let cli = Cli::try_parse_from([
            "onionctl",
            "fetch",
            "http://example.onion/",
            "-X",
            "POST",
            "-H",
            "A: 1",
            "-H",
            "B: 2",
            "-d",
            "body",
            "--via-controller",
        ])
        .unwrap();
        match cli.command {
            Commands::Fetch {
                method,
                headers,
                data,
                via_controller,
                ..
            } => {
                assert_eq!(method, "POST");
                assert_eq!(headers.len(), 2);
                assert_eq!(data.as_deref(), Some("body"));
                assert!(via_controller);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_run_and_verbosity() {
        let cli = Cli::try_parse_from(["onionctl", "-vv", "run", "--start"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Run { start: true }));
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.ipc.socket_path, "/tmp/onionctl.sock");
    }

    #[tokio::test]
    async fn test_invalid_config_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("onionctl.toml");
        std::fs::write(&path, "[tor]\nbootstrap_timeout_ms = 0\n").unwrap();
        assert!(load_config(&path).await.is_err());
    }
}
