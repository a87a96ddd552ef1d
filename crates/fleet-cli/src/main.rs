//! `fleetctl` — command-line client for the fleet control plane.
//!
//! A standalone HTTP client. No internal crate dependency — talks
//! exclusively via the REST API, the same boundary a human operator or a
//! dashboard would cross.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

/// fleetctl — operator CLI for the fleet control plane.
#[derive(Parser)]
#[command(
    name = "fleetctl",
    version,
    about = "fleetctl — list/terminate leases, enable/disable hosts",
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         FLEET_ADDR   Server address (default: http://127.0.0.1:8080)\n\n\
         {DIM}Examples:{RESET}\n  \
         fleetctl leases list\n  \
         fleetctl leases list --label linux-x64 --state RUNNING\n  \
         fleetctl leases terminate 7c2e1b0a-...\n  \
         fleetctl hosts enable build-42"
    )
)]
struct Cli {
    /// Fleet control plane server address.
    #[arg(long, env = "FLEET_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Disable colored output.
    #[arg(long, default_value = "false")]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lease operations.
    Leases {
        #[command(subcommand)]
        action: LeaseCommands,
    },
    /// Host operations.
    Hosts {
        #[command(subcommand)]
        action: HostCommands,
    },
    /// Server health check.
    Health,
}

#[derive(Subcommand)]
enum LeaseCommands {
    /// List leases, optionally filtered.
    List {
        /// Capability label to filter by.
        #[arg(long)]
        label: Option<String>,
        /// Lease state to filter by (e.g. `RUNNING`, `BOOTING`).
        #[arg(long)]
        state: Option<String>,
        /// Host id to filter by.
        #[arg(long)]
        host_id: Option<String>,
    },
    /// Force a lease into `TERMINATING`; the garbage collector finishes it.
    Terminate {
        /// Lease id.
        lease_id: String,
    },
}

#[derive(Subcommand)]
enum HostCommands {
    /// Re-admit a host to placement.
    Enable {
        /// Host id.
        host_id: String,
    },
    /// Exclude a host from placement. Existing leases are untouched.
    Disable {
        /// Host id.
        host_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client = Client::new(cli.addr);

    match run(client, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

async fn run(client: Client, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Leases { action } => cmd_leases(&client, action).await,
        Commands::Hosts { action } => cmd_hosts(&client, action).await,
        Commands::Health => cmd_health(&client).await,
    }
}

// ── Lease commands ───────────────────────────────────────────────────

async fn cmd_leases(client: &Client, action: LeaseCommands) -> Result<()> {
    match action {
        LeaseCommands::List { label, state, host_id } => {
            let mut query = Vec::new();
            if let Some(label) = &label {
                query.push(("label", label.as_str()));
            }
            if let Some(state) = &state {
                query.push(("state", state.as_str()));
            }
            if let Some(host_id) = &host_id {
                query.push(("host_id", host_id.as_str()));
            }

            let resp = client.get("/v1/leases", &query).await?;
            let leases = resp.as_array().cloned().unwrap_or_default();

            println!();
            header("📋", "Leases");
            println!();

            if leases.is_empty() {
                println!("  {DIM}No leases match.{RESET}");
                println!();
                return Ok(());
            }

            println!(
                "  {DIM}{:<36}  {:<16}  {:<12}  {:<20}  {}{RESET}",
                "LEASE ID", "LABEL", "STATE", "HOST", "LAST ERROR"
            );
            for lease in &leases {
                let lease_id = lease.get("lease_id").and_then(Value::as_str).unwrap_or("-");
                let label = lease.get("label").and_then(Value::as_str).unwrap_or("-");
                let state = lease.get("state").and_then(Value::as_str).unwrap_or("-");
                let host_id = lease.get("host_id").and_then(Value::as_str).unwrap_or("-");
                let last_error = lease.get("last_error").and_then(Value::as_str).unwrap_or("");

                let colored_state = match state {
                    "RUNNING" => format!("{GREEN}{state}{RESET}"),
                    "FAILED" => format!("{RED}{state}{RESET}"),
                    "TERMINATING" | "TERMINATED" => format!("{DIM}{state}{RESET}"),
                    _ => format!("{YELLOW}{state}{RESET}"),
                };

                println!("  {lease_id:<36}  {label:<16}  {colored_state:<12}  {host_id:<20}  {last_error}");
            }
            println!();
            println!("  {DIM}Total: {} lease(s){RESET}", leases.len());
            println!();
            Ok(())
        }
        LeaseCommands::Terminate { lease_id } => {
            client.post_empty(&format!("/v1/leases/{lease_id}/terminate")).await?;
            println!();
            success(&format!("lease {lease_id} marked TERMINATING"));
            println!();
            Ok(())
        }
    }
}

// ── Host commands ────────────────────────────────────────────────────

async fn cmd_hosts(client: &Client, action: HostCommands) -> Result<()> {
    match action {
        HostCommands::Enable { host_id } => {
            let resp = client.post_empty(&format!("/v1/hosts/{host_id}/enable")).await?;
            print_host(&resp);
            success(&format!("host {host_id} enabled"));
            Ok(())
        }
        HostCommands::Disable { host_id } => {
            let resp = client.post_empty(&format!("/v1/hosts/{host_id}/disable")).await?;
            print_host(&resp);
            warning(&format!("host {host_id} disabled — existing leases untouched"));
            Ok(())
        }
    }
}

fn print_host(resp: &Value) {
    println!();
    header("🖥", "Host");
    println!();
    kv_line("Host ID", resp.get("host_id").and_then(Value::as_str).unwrap_or("-"));
    let enabled = resp.get("enabled").and_then(Value::as_bool).unwrap_or(false);
    kv_line("Enabled", if enabled { "yes" } else { "no" });
    println!();
}

// ── Health ───────────────────────────────────────────────────────────

async fn cmd_health(client: &Client) -> Result<()> {
    let body = client.get_raw("/healthz").await?;
    println!();
    success(&format!("server responded: {body}"));
    println!();
    Ok(())
}

// ── Pretty output helpers ────────────────────────────────────────────

fn header(icon: &str, title: &str) {
    println!("{BOLD}{CYAN}{icon} {title}{RESET}");
    println!("{DIM}─────────────────────────────────────────{RESET}");
}

fn kv_line(key: &str, value: &str) {
    println!("  {DIM}{key:<20}{RESET} {WHITE}{value}{RESET}");
}

fn success(msg: &str) {
    println!("{GREEN}{BOLD}✓{RESET} {msg}");
}

fn warning(msg: &str) {
    println!("{YELLOW}{BOLD}⚠{RESET} {YELLOW}{msg}{RESET}");
}

// ── HTTP client ──────────────────────────────────────────────────────

struct Client {
    http: reqwest::Client,
    addr: String,
}

impl Client {
    fn new(addr: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.addr)
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }

    async fn get_raw(&self, path: &str) -> Result<String> {
        let resp = self.http.get(self.url(path)).send().await.context("request failed")?;
        let status = resp.status();
        let body = resp.text().await.context("failed to read response body")?;
        if !status.is_success() {
            bail!("server returned {status}: {body}");
        }
        Ok(body)
    }

    async fn post_empty(&self, path: &str) -> Result<Value> {
        let resp = self.http.post(self.url(path)).send().await.context("request failed")?;
        handle_response(resp).await
    }
}

async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::ACCEPTED {
        return Ok(Value::Null);
    }
    let body = resp.text().await.context("failed to read response body")?;
    if !status.is_success() {
        bail!("server returned {status}: {body}");
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).context("failed to parse response JSON")
}
