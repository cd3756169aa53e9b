// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// tailproxy - command-line host for tailproxyd

mod config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use tracing::debug;

use tailproxy_common::{
    DaemonClient, DaemonStatus, LogLevel, PeerStatus, RegistrationOutcome, RunConfiguration,
    TailnetStatus,
};

#[derive(Parser)]
#[command(name = "tailproxy")]
#[command(about = "Control the tailscaled supervisor", long_about = None)]
#[command(version)]
struct Cli {
    /// Control socket of tailproxyd (overrides cli.toml)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start tailscaled (restarts a running instance)
    Start {
        /// Run profile (TOML); the daemon's configured profile when omitted
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Embedded SSH listen address, "" disables the SSH server
        #[arg(long, requires = "profile")]
        ssh: Option<String>,

        /// Pre-authorized key for `tailscale up`
        #[arg(long, requires = "profile")]
        auth_key: Option<String>,
    },

    /// Stop tailscaled
    Stop,

    /// Show supervisor status
    Status {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Print captured logs
    Logs {
        /// Clear the log buffer instead of printing it
        #[arg(long)]
        clear: bool,
    },

    /// Set verbosity of forwarded tailscaled output (0 debug, 1 info, 2 error)
    LogLevel {
        #[arg(value_parser = parse_log_level)]
        level: LogLevel,
    },

    /// Run a tailscale command against the supervised daemon
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List tailnet peers
    Peers {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },
}

fn parse_log_level(value: &str) -> Result<LogLevel, String> {
    let number: i64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    LogLevel::try_from(number).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = create_daemon_client(cli.socket)?;

    match cli.command {
        Commands::Start {
            profile,
            ssh,
            auth_key,
        } => start(&client, profile.as_deref(), ssh, auth_key).await,
        Commands::Stop => stop(&client).await,
        Commands::Status { json } => show_status(&client, json).await,
        Commands::Logs { clear } => logs(&client, clear).await,
        Commands::LogLevel { level } => {
            client.set_log_level(level).await?;
            println!("{}", format!("✓ Log level set to {}", level).green());
            Ok(())
        }
        Commands::Exec { args } => {
            let output = client.run_command(&args.join(" ")).await?;
            print!("{}", output);
            if !output.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        Commands::Peers { json } => peers(&client, json).await,
    }
}

fn create_daemon_client(socket: Option<PathBuf>) -> Result<DaemonClient> {
    let client = match socket {
        Some(socket) => DaemonClient::with_socket(socket)?,
        None => DaemonClient::new(&config::CliConfig::load()?.daemon_config)?,
    };
    debug!("Using daemon socket {}", client.socket().display());
    Ok(client)
}

/// Load a profile file and apply the command line overrides
fn load_profile(
    path: &Path,
    ssh: Option<String>,
    auth_key: Option<String>,
) -> Result<RunConfiguration> {
    let mut profile = RunConfiguration::load(path)
        .with_context(|| format!("Failed to load profile {}", path.display()))?;

    if let Some(ssh) = ssh {
        profile.ssh_listen = ssh;
    }
    if let Some(key) = auth_key {
        profile.auth_key = Some(key);
    }
    Ok(profile)
}

async fn start(
    client: &DaemonClient,
    profile: Option<&Path>,
    ssh: Option<String>,
    auth_key: Option<String>,
) -> Result<()> {
    let run = profile
        .map(|path| load_profile(path, ssh, auth_key))
        .transpose()?;

    match &run {
        Some(run) => println!(
            "{}",
            format!("Starting tailscaled from {}", run.executable_path)
                .green()
                .bold()
        ),
        None => println!("{}", "Starting configured profile".green().bold()),
    }

    client.start(run.as_ref()).await?;

    println!(
        "{}",
        "✓ Start requested. Follow progress with 'tailproxy status' or 'tailproxy logs'".dimmed()
    );
    Ok(())
}

async fn stop(client: &DaemonClient) -> Result<()> {
    println!("{}", "Stopping tailscaled".yellow());
    client.stop().await?;
    println!("{}", "✓ tailscaled stopped".green().bold());
    Ok(())
}

async fn show_status(client: &DaemonClient, json: bool) -> Result<()> {
    let status = client.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_status(&status);
    Ok(())
}

fn print_status(status: &DaemonStatus) {
    println!();
    let running = if status.running {
        "running".green().bold()
    } else {
        "stopped".red().bold()
    };
    println!("{} {}", "tailscaled:".bold(), running);
    println!("  SSH server:   {}", ssh_state(status.ssh_listening));
    println!("  Log level:    {}", status.log_level);
    println!("  Registration: {}", describe_registration(&status.registration));
    if let Some(dir) = &status.data_dir {
        println!("  Data dir:     {}", dir.dimmed());
    }
    println!();
}

fn ssh_state(listening: bool) -> String {
    if listening {
        "listening".green().to_string()
    } else {
        "off".dimmed().to_string()
    }
}

fn describe_registration(outcome: &RegistrationOutcome) -> String {
    match outcome {
        RegistrationOutcome::Pending => "pending".to_string(),
        RegistrationOutcome::Registered { attempts } => {
            format!("registered after {} attempt(s)", attempts)
        }
        RegistrationOutcome::InvalidCredential { attempts } => {
            format!("auth key rejected (attempt {})", attempts)
        }
        RegistrationOutcome::Exhausted { attempts } => {
            format!("gave up after {} attempts", attempts)
        }
        RegistrationOutcome::Cancelled => "cancelled".to_string(),
    }
}

async fn logs(client: &DaemonClient, clear: bool) -> Result<()> {
    if clear {
        client.clear_logs().await?;
        println!("{}", "✓ Logs cleared".green());
        return Ok(());
    }

    let text = client.logs().await?;
    if text.is_empty() {
        println!("{}", "No log entries.".yellow());
    } else {
        print!("{}", text);
    }
    Ok(())
}

async fn peers(client: &DaemonClient, json: bool) -> Result<()> {
    let Some(status) = client.peers().await? else {
        println!("{}", "tailscaled is not running.".yellow());
        println!("Start it with: {}", "tailproxy start".cyan());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_peers_table(&status);
    }
    Ok(())
}

/// Host, IP, OS and connection columns of one peer
fn peer_row(peer: &PeerStatus) -> [String; 4] {
    let connection = if !peer.is_online() {
        "offline".to_string()
    } else if peer.direct == Some(true) {
        "direct".to_string()
    } else {
        match peer.relay.as_deref() {
            Some(relay) if !relay.is_empty() => format!("relay {}", relay),
            _ => "online".to_string(),
        }
    };

    [
        peer.host_name.clone(),
        peer.primary_ip().to_string(),
        peer.os.clone().unwrap_or_else(|| "-".to_string()),
        connection,
    ]
}

fn print_peers_table(status: &TailnetStatus) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Host")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("IP")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("OS")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Connection")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
    ]);

    let peers = status.sorted_peers();
    for peer in &peers {
        let [host, ip, os, connection] = peer_row(peer);
        let color = if peer.is_online() {
            Color::Green
        } else {
            Color::DarkGrey
        };
        table.add_row(vec![
            Cell::new(host).fg(color),
            Cell::new(ip),
            Cell::new(os),
            Cell::new(connection).fg(color),
        ]);
    }

    println!();
    println!(
        "{} {} ({})",
        "This node:".bold(),
        status.self_node.host_name.green(),
        status.self_node.primary_ip()
    );
    println!("{}", table);
    println!();
    println!("{} peer(s)", peers.len().to_string().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    fn peer(json: &str) -> PeerStatus {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exec_keeps_flags() {
        let cli = Cli::try_parse_from(["tailproxy", "exec", "ping", "--c", "3", "peer"]).unwrap();
        match cli.command {
            Commands::Exec { args } => assert_eq!(args, vec!["ping", "--c", "3", "peer"]),
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_log_level_argument() {
        let cli = Cli::try_parse_from(["tailproxy", "log-level", "2"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::LogLevel {
                level: LogLevel::Error
            }
        ));
        assert!(Cli::try_parse_from(["tailproxy", "log-level", "3"]).is_err());
        assert!(Cli::try_parse_from(["tailproxy", "log-level", "loud"]).is_err());
    }

    #[test]
    fn test_overrides_require_profile() {
        assert!(Cli::try_parse_from(["tailproxy", "start", "--ssh", "127.0.0.1:22"]).is_err());
        assert!(Cli::try_parse_from(["tailproxy", "start", "-p", "run.toml", "--ssh", ""]).is_ok());
    }

    #[test]
    fn test_load_profile_applies_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            "ssh_listen = \"127.0.0.1:1056\"\n\
             executable_path = \"/opt/ts/libtailscaled.so\"\n\
             socket_path = \"/var/lib/ts/ts.sock\"\n\
             state_path = \"/var/lib/ts/state\"\n",
        )
        .unwrap();

        let profile = load_profile(&path, Some(String::new()), Some("tskey-1".to_string())).unwrap();
        assert!(!profile.ssh_enabled());
        assert_eq!(profile.auth_key(), Some("tskey-1"));

        let profile = load_profile(&path, None, None).unwrap();
        assert_eq!(profile.ssh_listen, "127.0.0.1:1056");
        assert_eq!(profile.auth_key(), None);
    }

    #[test]
    fn test_peer_row() {
        let direct = peer(
            r#"{"HostName":"laptop","OS":"linux","TailscaleIPs":["100.64.0.2"],"Online":true,"Direct":true}"#,
        );
        assert_eq!(peer_row(&direct), ["laptop", "100.64.0.2", "linux", "direct"].map(String::from));

        let relayed = peer(r#"{"HostName":"nas","Online":true,"Relay":"fra"}"#);
        assert_eq!(
            peer_row(&relayed),
            ["nas", "Unknown IP", "-", "relay fra"].map(String::from)
        );

        let offline = peer(r#"{"HostName":"old","Online":false}"#);
        assert_eq!(peer_row(&offline)[3], "offline");
    }

    #[test]
    fn test_describe_registration() {
        assert_eq!(describe_registration(&RegistrationOutcome::Pending), "pending");
        assert_eq!(
            describe_registration(&RegistrationOutcome::Exhausted { attempts: 10 }),
            "gave up after 10 attempts"
        );
    }
}
