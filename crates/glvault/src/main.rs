use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "glvault", about = "glvault — API-key vault and relay proxy", version)]
struct Cli {
    /// Vault server URL (default: http://localhost:8080 or $GLVAULT_SERVER)
    #[arg(long, env = "GLVAULT_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Admin bearer token for key management ($ADMIN_TOKEN)
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the vault relay server (configuration from the environment)
    Serve,
    /// Register a credential under an alias
    Register {
        /// Alias the caller will use in place of the credential
        alias: String,
        /// The plaintext credential to protect
        api_key: String,
        /// Upstream API base URL, e.g. https://api.openweathermap.org
        base_url: String,
        /// Maximum relays per rate-limit window (default 1000)
        #[arg(long)]
        quota_limit: Option<u64>,
        /// Provenance label stored with the record
        #[arg(long)]
        owner: Option<String>,
    },
    /// List registered credentials (metadata only)
    List,
    /// Re-encrypt an alias with a new credential
    Rotate {
        /// Alias to rotate
        alias: String,
        /// The replacement credential
        new_api_key: String,
    },
    /// Delete a credential
    Remove {
        /// Alias to delete
        alias: String,
    },
    /// Show audit stats and recent relay attempts for an alias
    Audit {
        /// Alias to inspect
        alias: String,
        /// Window start (Unix epoch milliseconds)
        #[arg(long)]
        since: Option<i64>,
        /// Maximum entries to return
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Check server and storage health
    Health,
}

// ── Request context ───────────────────────────────────────────────────────────

/// Shared HTTP client + normalized server URL + admin token. Created once in
/// main and passed to every command.
struct Ctx {
    client: Client,
    server: String,
    admin_token: Option<String>,
}

impl Ctx {
    fn new(server: String, admin_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            server: server.trim_end_matches('/').to_owned(),
            admin_token,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_auth(self.client.get(format!("{}/{}", self.server, path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_auth(self.client.post(format!("{}/{}", self.server, path)))
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_auth(self.client.delete(format!("{}/{}", self.server, path)))
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.admin_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&log_level))
        .init();

    if let Commands::Serve = cli.command {
        let cfg = glvault_server::Config::from_env()?;
        return glvault_server::run(cfg).await;
    }

    let ctx = Ctx::new(cli.server, cli.admin_token);

    match cli.command {
        Commands::Serve => unreachable!(),

        Commands::Register {
            alias,
            api_key,
            base_url,
            quota_limit,
            owner,
        } => cmd_register(&ctx, &alias, &api_key, &base_url, quota_limit, owner).await,

        Commands::List => cmd_list(&ctx).await,

        Commands::Rotate { alias, new_api_key } => cmd_rotate(&ctx, &alias, &new_api_key).await,

        Commands::Remove { alias } => cmd_remove(&ctx, &alias).await,

        Commands::Audit {
            alias,
            since,
            limit,
        } => cmd_audit(&ctx, &alias, since, limit).await,

        Commands::Health => cmd_health(&ctx).await,
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Returns the response on success, or bails with the server's status code
/// and error body.
async fn require_success(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    anyhow::bail!("server returned {status}: {text}")
}

fn format_ms_timestamp(ms: i64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_register(
    ctx: &Ctx,
    alias: &str,
    api_key: &str,
    base_url: &str,
    quota_limit: Option<u64>,
    owner: Option<String>,
) -> Result<()> {
    let mut body = serde_json::json!({
        "alias": alias,
        "api_key": api_key,
        "base_url": base_url,
    });
    if let Some(q) = quota_limit {
        body["quota_limit"] = serde_json::json!(q);
    }
    if let Some(ref o) = owner {
        body["owner"] = serde_json::json!(o);
    }

    let resp = require_success(
        ctx.post("keys/register")
            .json(&body)
            .send()
            .await
            .context("HTTP request failed")?,
    )
    .await?;

    let json: Value = resp.json().await?;
    println!("✓ registered {alias}");
    println!("  base_url:    {}", json["base_url"].as_str().unwrap_or("?"));
    println!("  quota_limit: {}", json["quota_limit"]);
    println!("  owner:       {}", json["owner"].as_str().unwrap_or("?"));
    Ok(())
}

async fn cmd_list(ctx: &Ctx) -> Result<()> {
    let resp = require_success(
        ctx.get("keys/list")
            .send()
            .await
            .context("HTTP request failed")?,
    )
    .await?;

    let json: Value = resp.json().await?;
    let keys = json["keys"].as_array();
    match keys {
        Some(arr) if arr.is_empty() => println!("(no credentials registered)"),
        Some(arr) => {
            for k in arr {
                let alias = k["alias"].as_str().unwrap_or("?");
                let base_url = k["base_url"].as_str().unwrap_or("?");
                let used = k["quota_used"].as_u64().unwrap_or(0);
                let limit = k["quota_limit"].as_u64().unwrap_or(0);
                let rotated = if k.get("rotated_at").is_some() {
                    " [rotated]"
                } else {
                    ""
                };
                println!("  {alias}  {base_url}  {used}/{limit} this window{rotated}");
            }
        }
        None => println!("(no credentials registered)"),
    }
    Ok(())
}

async fn cmd_rotate(ctx: &Ctx, alias: &str, new_api_key: &str) -> Result<()> {
    let body = serde_json::json!({"alias": alias, "new_api_key": new_api_key});
    let resp = require_success(
        ctx.post("keys/rotate")
            .json(&body)
            .send()
            .await
            .context("HTTP request failed")?,
    )
    .await?;

    let json: Value = resp.json().await?;
    let rotated_at = json["rotated_at"].as_i64().unwrap_or(0);
    println!("✓ rotated {alias} at {}", format_ms_timestamp(rotated_at));
    Ok(())
}

async fn cmd_remove(ctx: &Ctx, alias: &str) -> Result<()> {
    let body = serde_json::json!({"alias": alias});
    let resp = require_success(
        ctx.delete("keys/remove")
            .json(&body)
            .send()
            .await
            .context("HTTP request failed")?,
    )
    .await?;

    let json: Value = resp.json().await?;
    if json["deleted"].as_bool().unwrap_or(false) {
        println!("✓ removed {alias}");
    } else {
        println!("{alias} was not registered");
    }
    Ok(())
}

async fn cmd_audit(ctx: &Ctx, alias: &str, since: Option<i64>, limit: usize) -> Result<()> {
    let mut url = format!("keys/audit?alias={alias}&limit={limit}");
    if let Some(s) = since {
        url.push_str(&format!("&since={s}"));
    }

    let resp = require_success(ctx.get(&url).send().await.context("HTTP request failed")?).await?;

    let json: Value = resp.json().await?;
    let stats = &json["stats"];
    println!(
        "{alias}: {} request(s), {} error(s), avg latency {} ms",
        stats["total_requests"], stats["error_count"], stats["avg_latency_ms"]
    );

    let entries = json["entries"].as_array();
    match entries {
        Some(arr) if arr.is_empty() => println!("(no audit entries)"),
        Some(arr) => {
            for e in arr {
                let ts = e["timestamp"].as_i64().unwrap_or(0);
                let method = e["method"].as_str().unwrap_or("?");
                let path = e["path"].as_str().unwrap_or("?");
                let status = e["status"].as_u64().unwrap_or(0);
                let latency = e["latency_ms"].as_u64().unwrap_or(0);
                let error = e["error"]
                    .as_str()
                    .map(|s| format!("  ({s})"))
                    .unwrap_or_default();
                println!(
                    "  [{}] {method} {path} → {status} in {latency}ms{error}",
                    format_ms_timestamp(ts)
                );
            }
        }
        None => println!("(no audit entries)"),
    }
    Ok(())
}

async fn cmd_health(ctx: &Ctx) -> Result<()> {
    let resp = ctx
        .get("health")
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;

    println!("status:  {}", json["status"].as_str().unwrap_or("?"));
    println!("version: {}", json["version"].as_str().unwrap_or("?"));
    println!("storage: {}", json["storage"].as_str().unwrap_or("?"));
    println!("keys:    {}", json["keys_registered"]);
    if !status.is_success() {
        anyhow::bail!("server degraded ({status})");
    }
    Ok(())
}
