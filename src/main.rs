//! cqlwire - CQL native protocol probe
//!
//! Dials one node, performs the handshake and optionally runs one statement.

use clap::Parser;
use cqlwire_client::{dial, ClientConfig, ExecuteOptions, LogErrorHandler, Tracer};
use cqlwire_protocol::{Consistency, Query, QueryResult, Request, Response};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "cqlwire")]
#[command(about = "Probe a CQL node over the native protocol")]
#[command(version)]
struct Cli {
    /// Node address
    #[arg(default_value = "127.0.0.1:9042")]
    addr: SocketAddr,

    /// YAML configuration file
    #[arg(short, long, env = "CQLWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Protocol version to negotiate (1-5)
    #[arg(long)]
    protocol_version: Option<u8>,

    /// Username for password authentication
    #[arg(short, long, env = "CQLWIRE_USERNAME")]
    username: Option<String>,

    /// Password for password authentication
    #[arg(short, long, env = "CQLWIRE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Keyspace to USE after connecting
    #[arg(long)]
    keyspace: Option<String>,

    /// Statement to run once connected
    #[arg(short, long)]
    execute: Option<String>,

    /// Consistency level for the statement
    #[arg(long, default_value = "ONE")]
    consistency: Consistency,

    /// Request server-side tracing for the statement
    #[arg(long)]
    trace: bool,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "CQLWIRE_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "CQLWIRE_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "CQLWIRE_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "CQLWIRE_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to the node address)
    #[arg(long)]
    server_name: Option<String>,
}

/// Prints the trace session id so it can be looked up in `system_traces`.
struct PrintTracer;

impl Tracer for PrintTracer {
    fn trace(&self, tracing_id: Uuid) {
        println!("trace id: {tracing_id}");
    }
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::from_env(),
        };

        if let Some(version) = self.protocol_version {
            config.protocol_version = version;
        }
        if let Some(keyspace) = &self.keyspace {
            config.keyspace = Some(keyspace.clone());
        }
        if self.username.is_some() || self.password.is_some() {
            config.auth.username = self.username.clone();
            config.auth.password = self.password.clone();
        }

        let tls = &mut config.tls;
        tls.enabled |= self.tls || self.insecure || self.ca_cert.is_some();
        if let Some(path) = &self.ca_cert {
            tls.ca_cert_path = Some(path.clone());
        }
        if let Some(path) = &self.client_cert {
            tls.client_cert_path = Some(path.clone());
        }
        if let Some(path) = &self.client_key {
            tls.client_key_path = Some(path.clone());
        }
        tls.insecure |= self.insecure;
        if let Some(name) = &self.server_name {
            tls.server_name = Some(name.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.client_config()?.connection_config()?;
    if config.tls.as_ref().is_some_and(|tls| tls.insecure) {
        tracing::warn!("TLS certificate verification disabled");
    }

    let started = Instant::now();
    let conn = dial(cli.addr, config, Arc::new(LogErrorHandler)).await?;
    tracing::info!(
        addr = %conn.address(),
        version = %conn.protocol_version(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "connected"
    );
    for (option, values) in &conn.supported().options {
        println!("{option}: {}", values.join(", "));
    }
    if let Some(keyspace) = conn.current_keyspace() {
        println!("keyspace: {keyspace}");
    }

    if let Some(statement) = &cli.execute {
        let request =
            Request::Query(Query::new(statement.as_str()).with_consistency(cli.consistency));
        let started = Instant::now();
        let mut options = ExecuteOptions::new();
        if cli.trace {
            options = options.with_tracer(Arc::new(PrintTracer));
        }
        let parsed = conn.execute(&request, options).await?;
        let elapsed = started.elapsed();

        for warning in &parsed.warnings {
            println!("warning: {warning}");
        }
        match parsed.response {
            Response::Result(QueryResult::Rows(rows)) => {
                let names: Vec<_> = rows
                    .metadata
                    .columns
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect();
                println!("columns: {}", names.join(", "));
                println!("{} row(s) in {:?}", rows.len(), elapsed);
                if rows.metadata.has_more_pages() {
                    println!("more pages available");
                }
            }
            Response::Result(QueryResult::SetKeyspace(keyspace)) => {
                println!("keyspace set to {keyspace}")
            }
            Response::Result(QueryResult::SchemaChange(change)) => println!(
                "schema {} {:?} {}{}",
                change.change,
                change.target,
                change.keyspace,
                change.name.map(|n| format!(".{n}")).unwrap_or_default()
            ),
            Response::Result(_) => println!("ok in {elapsed:?}"),
            Response::Error(err) => {
                conn.close();
                return Err(err.into());
            }
            other => println!("unexpected {} response", other.opcode()),
        }
    }

    conn.close();
    Ok(())
}
