//! Binary entry point for poolkeeper.
//!
//! Small operator CLI: probe a backend the way the registry would, or derive
//! an object URL through the URL cache.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use poolkeeper::backend::{ObjectStoreAdapter, SqliteAdapter};
use poolkeeper::config::BackendConfig;
use poolkeeper::observability::{self, ObservabilityConfig};
use poolkeeper::{
    BackendAdapter, DatabaseConfig, MemoryCache, ObjectRef, ObjectStoreConfig, Registry, UrlCache,
    UrlOptions,
};
use std::process::ExitCode;
use std::time::{Duration, Instant};

/// Poolkeeper - named backend registries and stampede-safe caching.
#[derive(Parser)]
#[command(name = "poolkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Backend kinds the CLI can probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Sqlite,
    Mysql,
    Postgres,
    Redis,
    ObjectStore,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Construct and probe one backend alias.
    Probe {
        /// Backend kind.
        #[arg(short, long, value_enum)]
        backend: BackendKind,

        /// Alias to register the backend under.
        #[arg(short, long, default_value = "default")]
        alias: String,

        /// Connection target: `SQLite` path, MySQL or PostgreSQL DSN, Redis
        /// `host:port` or object store endpoint.
        #[arg(short, long, env = "POOLKEEPER_DSN")]
        dsn: String,

        /// Construction + probe bound in milliseconds.
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        /// Object store access key id.
        #[arg(long, env = "POOLKEEPER_ACCESS_KEY")]
        access_key: Option<String>,

        /// Object store secret access key (`ENV:VAR` supported).
        #[arg(long, env = "POOLKEEPER_SECRET_KEY", hide_env_values = true)]
        secret_key: Option<String>,
    },

    /// Print a URL for an object, signed unless `--expiry-secs 0`.
    Presign {
        /// Object path as `bucket/key`.
        object: String,

        /// Object store endpoint (`host[:port]` or full URL).
        #[arg(short, long, env = "POOLKEEPER_ENDPOINT")]
        endpoint: String,

        /// Access key id.
        #[arg(long, env = "POOLKEEPER_ACCESS_KEY")]
        access_key: String,

        /// Secret access key (`ENV:VAR` supported).
        #[arg(long, env = "POOLKEEPER_SECRET_KEY", hide_env_values = true)]
        secret_key: String,

        /// Signing region.
        #[arg(long, default_value = "us-east-1")]
        region: String,

        /// Use HTTPS for a bare endpoint.
        #[arg(long)]
        ssl: bool,

        /// Signature lifetime in seconds; 0 prints the public URL.
        #[arg(long, default_value = "3600")]
        expiry_secs: u64,

        /// Object version appended as `v=`.
        #[arg(long)]
        version: Option<String>,
    },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = observability::init(ObservabilityConfig::from_env(cli.verbose)) {
        eprintln!("Warning: failed to initialize observability: {e}");
    }

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Probe {
            backend,
            alias,
            dsn,
            timeout_ms,
            access_key,
            secret_key,
        } => {
            let timeout = Duration::from_millis(timeout_ms);
            match backend {
                BackendKind::Sqlite => {
                    let config = DatabaseConfig::new(alias, dsn).with_probe_timeout(timeout);
                    probe(SqliteAdapter::new(), &config)
                },
                BackendKind::Mysql => probe_mysql(alias, dsn, timeout),
                BackendKind::Postgres => probe_postgres(alias, dsn, timeout),
                BackendKind::Redis => probe_redis(alias, dsn, timeout),
                BackendKind::ObjectStore => {
                    let config = ObjectStoreConfig::new(
                        alias,
                        dsn,
                        access_key.unwrap_or_default(),
                        secret_key.as_deref().unwrap_or_default(),
                    )
                    .with_probe_timeout(timeout);
                    probe(ObjectStoreAdapter::new(), &config)
                },
            }
        },
        Commands::Presign {
            object,
            endpoint,
            access_key,
            secret_key,
            region,
            ssl,
            expiry_secs,
            version,
        } => presign(
            &object,
            ObjectStoreConfig::new("cli", endpoint, access_key, &secret_key)
                .with_region(region)
                .with_ssl(ssl),
            expiry_secs,
            version,
        ),
    }
}

fn probe<A: BackendAdapter>(adapter: A, config: &A::Config) -> Result<()> {
    let registry = Registry::new(adapter);
    let kind = registry.adapter().kind();
    let start = Instant::now();

    registry
        .get_or_init(config)
        .with_context(|| format!("{kind} alias '{}'", config.alias()))?;

    println!(
        "{kind} alias '{}' ready in {}ms",
        config.alias(),
        start.elapsed().as_millis()
    );
    registry.shutdown();
    Ok(())
}

#[cfg(feature = "mysql")]
fn probe_mysql(alias: String, dsn: String, timeout: Duration) -> Result<()> {
    let config = DatabaseConfig::new(alias, dsn).with_probe_timeout(timeout);
    probe(poolkeeper::backend::MySqlAdapter::new(), &config)
}

#[cfg(not(feature = "mysql"))]
fn probe_mysql(_alias: String, dsn: String, _timeout: Duration) -> Result<()> {
    anyhow::bail!(
        "MySQL support not compiled in (target {}); rebuild with --features mysql",
        poolkeeper::config::redact_dsn(&dsn)
    )
}

#[cfg(feature = "postgres")]
fn probe_postgres(alias: String, dsn: String, timeout: Duration) -> Result<()> {
    let config = DatabaseConfig::new(alias, dsn).with_probe_timeout(timeout);
    probe(poolkeeper::backend::PostgresAdapter::new(), &config)
}

#[cfg(not(feature = "postgres"))]
fn probe_postgres(_alias: String, dsn: String, _timeout: Duration) -> Result<()> {
    anyhow::bail!(
        "PostgreSQL support not compiled in (target {}); rebuild with --features postgres",
        poolkeeper::config::redact_dsn(&dsn)
    )
}

#[cfg(feature = "redis")]
fn probe_redis(alias: String, addr: String, timeout: Duration) -> Result<()> {
    let config = poolkeeper::RedisConfig::new(alias)
        .with_addr(addr)
        .with_probe_timeout(timeout);
    probe(poolkeeper::backend::RedisAdapter::new(), &config)
}

#[cfg(not(feature = "redis"))]
fn probe_redis(_alias: String, addr: String, _timeout: Duration) -> Result<()> {
    anyhow::bail!(
        "Redis support not compiled in (target {}); rebuild with --features redis",
        poolkeeper::config::redact_dsn(&addr)
    )
}

fn presign(
    object: &str,
    config: ObjectStoreConfig,
    expiry_secs: u64,
    version: Option<String>,
) -> Result<()> {
    config.validate().context("object store configuration")?;
    let client = ObjectStoreAdapter::new()
        .construct(&config)
        .context("building object store client")?;

    let urls = UrlCache::new(MemoryCache::default());
    let mut options = UrlOptions::new().with_expiry(Duration::from_secs(expiry_secs));
    if let Some(version) = version {
        options = options.with_version(version);
    }

    let url = urls
        .get_or_derive_url(&client, &ObjectRef::from_path(object), &options)
        .with_context(|| format!("deriving URL for '{object}'"))?;
    println!("{url}");
    Ok(())
}
