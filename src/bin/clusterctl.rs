//! CLI entry point for gateway-clusterctl: admin client for a cluster node.

use clap::{Parser, Subcommand};
use reqwest::{Method, StatusCode};

#[derive(Parser)]
#[command(name = "gateway-clusterctl", about = "Gateway cluster admin tool")]
struct Cli {
    /// Admin API address of the node to talk to.
    #[arg(long, default_value = "http://127.0.0.1:2381")]
    addr: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the node's membership view
    Members,
    /// Show the node's published status document
    Status,
    /// Remove a member from the cluster and revoke its lease
    Purge { name: String },
    /// Control the node's embedded store server
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Start the server and wait until it is ready
    Start,
    /// Stop the server
    Stop,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let (method, path) = match &cli.command {
        Commands::Members => (Method::GET, "/cluster/members".to_string()),
        Commands::Status => (Method::GET, "/cluster/status".to_string()),
        Commands::Purge { name } => (Method::DELETE, format!("/cluster/members/{name}")),
        Commands::Server { action } => match action {
            ServerAction::Start => (Method::POST, "/cluster/server/start".to_string()),
            ServerAction::Stop => (Method::POST, "/cluster/server/stop".to_string()),
        },
    };
    let rc = run(&cli.addr, method, &path).await;
    std::process::exit(rc);
}

async fn run(addr: &str, method: Method, path: &str) -> i32 {
    let url = format!("{}{}", addr.trim_end_matches('/'), path);
    let client = reqwest::Client::new();
    let response = match client.request(method, &url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: request to {} failed: {}", url, e);
            return 1;
        }
    };

    let status = response.status();
    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error reading response: {}", e);
            return 1;
        }
    };

    if status.is_success() {
        if status != StatusCode::NO_CONTENT {
            println!("{}", pretty(&body));
        }
        0
    } else {
        eprintln!("Error: {} {}", status.as_u16(), pretty(&body));
        1
    }
}

/// Pretty-print JSON bodies; anything else is passed through.
fn pretty(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| body.to_string())
}
