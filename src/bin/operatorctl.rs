// =============================================================================
// canopyctl — thin HTTP client over the operator API
// =============================================================================
//
// Every subcommand maps to exactly one request against the `canopy` binary's
// operator surface (src/api/rest.rs). Exit codes follow spec.md §6: 0 on a
// clean response, 2 on a client/usage error (bad args, missing token), 3 on
// an unrecoverable failure talking to the server.
// =============================================================================

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "canopyctl", about = "Operator CLI for the canopy control plane")]
struct Cli {
    #[arg(long, env = "CANOPY_API_ADDR", default_value = "http://127.0.0.1:7331")]
    addr: String,

    #[arg(long, env = "CANOPY_OPERATOR_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print current risk state, scheduler mode, task counts, and allocation.
    Status,
    /// Trip the circuit breaker with an operator-supplied reason.
    Trip { reason: String },
    /// Reset a tripped circuit breaker back to its pre-trip state.
    Reset,
    /// Pause a single task definition (does not affect in-flight instances).
    Pause { task_id: String },
    /// Resume a paused task definition.
    Resume { task_id: String },
    /// Recompute allocation targets and report the resulting rebalance plan size.
    Rebalance {
        #[arg(long, default_value = "equal_weight")]
        algorithm: String,
    },
    /// Flip the scheduler between Running and Paused.
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum ModeArg {
    Running,
    Paused,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let result = match cli.command {
        Command::Status => get(&client, &cli.addr, "/api/v1/status", cli.token.as_deref()).await,
        Command::Trip { reason } => {
            post(
                &client,
                &cli.addr,
                "/api/v1/risk/trip",
                cli.token.as_deref(),
                serde_json::json!({ "reason": reason }),
            )
            .await
        }
        Command::Reset => {
            let Some(token) = cli.token.clone() else {
                eprintln!("error: --token (or CANOPY_OPERATOR_TOKEN) is required to reset the circuit breaker");
                std::process::exit(2);
            };
            post(
                &client,
                &cli.addr,
                "/api/v1/risk/reset",
                cli.token.as_deref(),
                serde_json::json!({ "token": token }),
            )
            .await
        }
        Command::Pause { task_id } => {
            post(
                &client,
                &cli.addr,
                &format!("/api/v1/tasks/{task_id}/pause"),
                cli.token.as_deref(),
                serde_json::json!({}),
            )
            .await
        }
        Command::Resume { task_id } => {
            post(
                &client,
                &cli.addr,
                &format!("/api/v1/tasks/{task_id}/resume"),
                cli.token.as_deref(),
                serde_json::json!({}),
            )
            .await
        }
        Command::Rebalance { algorithm } => {
            post(
                &client,
                &cli.addr,
                "/api/v1/allocator/rebalance",
                cli.token.as_deref(),
                serde_json::json!({ "algorithm": algorithm }),
            )
            .await
        }
        Command::Mode { mode } => {
            let running = matches!(mode, ModeArg::Running);
            post(
                &client,
                &cli.addr,
                "/api/v1/scheduler/mode",
                cli.token.as_deref(),
                serde_json::json!({ "running": running }),
            )
            .await
        }
    };

    match result {
        Ok(body) => {
            if !body.is_empty() {
                println!("{body}");
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(3);
        }
    }
}

async fn get(client: &reqwest::Client, addr: &str, path: &str, token: Option<&str>) -> Result<String, anyhow::Error> {
    let mut req = client.get(format!("{addr}{path}"));
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }
    let resp = req.send().await?;
    Ok(finish(resp).await?)
}

async fn post(
    client: &reqwest::Client,
    addr: &str,
    path: &str,
    token: Option<&str>,
    body: serde_json::Value,
) -> Result<String, anyhow::Error> {
    let mut req = client.post(format!("{addr}{path}")).json(&body);
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }
    let resp = req.send().await?;
    Ok(finish(resp).await?)
}

async fn finish(resp: reqwest::Response) -> Result<String, anyhow::Error> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("server returned {status}: {text}");
    }
    Ok(text)
}
