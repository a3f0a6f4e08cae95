//! Hearthcache command line
//!
//! Operates on the tiers named in a configuration file. In-memory tiers live
//! only as long as the process, so the commands are mostly useful against
//! directory tiers and snapshot files.
//!
//! ```text
//! hearthcache --config cache.yaml stats --prometheus
//! hearthcache --config cache.yaml export snapshot.json
//! hearthcache --config cache.yaml invalidate household:7 user:42
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hearthcache::cache::parse_duration;
use hearthcache::error::{Error, Result};
use hearthcache::{CacheConfig, CacheManager, CacheSnapshot};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Hearthcache - multi-tier response cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration file (YAML). Defaults apply when omitted.
    #[arg(long, env = "HEARTHCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration
    Config,

    /// Print cache statistics
    Stats {
        /// Prometheus text exposition instead of JSON
        #[arg(long)]
        prometheus: bool,
    },

    /// Read a cached value
    Get { key: String },

    /// Cache a JSON value
    Set {
        key: String,
        /// JSON document to cache
        value: String,
        /// TTL such as "30s" or "5m"; the configured default when omitted
        #[arg(long)]
        ttl: Option<String>,
        /// Invalidation tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Remove a key from every tier
    Delete { key: String },

    /// Remove every entry carrying any of the tags
    Invalidate {
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Remove expired entries now
    Sweep,

    /// Remove everything
    Clear,

    /// Write live entries to a snapshot file
    Export { file: PathBuf },

    /// Load entries from a snapshot file
    Import { file: PathBuf },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            CacheConfig::from_yaml_file(path)?
        }
        None => CacheConfig::default(),
    };

    if let Command::Config = args.command {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let cache = CacheManager::open(config).await?;
    let outcome = run(&cache, args.command).await;
    cache.shutdown().await;
    outcome
}

async fn run(cache: &CacheManager, command: Command) -> Result<()> {
    match command {
        Command::Config => {}
        Command::Stats { prometheus } => {
            let stats = cache.stats();
            if prometheus {
                print!("{}", stats.to_prometheus()?);
            } else {
                print_json(&stats)?;
            }
        }
        Command::Get { key } => {
            let value = cache.get::<Value>(&key).await;
            print_json(&json!({ "key": key, "found": value.is_some(), "value": value }))?;
        }
        Command::Set {
            key,
            value,
            ttl,
            tags,
        } => {
            let value: Value = serde_json::from_str(&value)?;
            let ttl = match ttl {
                Some(raw) => parse_duration(&raw)?,
                None => cache.default_ttl(),
            };
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            let stored = cache.set(&key, &value, ttl, &tags).await;
            print_json(&json!({ "key": key, "stored": stored, "ttlMs": millis(ttl) }))?;
        }
        Command::Delete { key } => {
            let removed = cache.delete(&key).await;
            print_json(&json!({ "key": key, "removed": removed }))?;
        }
        Command::Invalidate { tags } => {
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            let removed = cache.invalidate_tags(&tags).await;
            print_json(&json!({ "tags": tags, "removed": removed }))?;
        }
        Command::Sweep => {
            let removed = cache.sweep_expired().await;
            print_json(&json!({ "expired": removed }))?;
        }
        Command::Clear => {
            cache.clear().await;
            print_json(&json!({ "cleared": true }))?;
        }
        Command::Export { file } => {
            let snapshot = cache.export().await;
            snapshot.write_to_file(&file).await?;
            print_json(&json!({ "file": file, "entries": snapshot.len() }))?;
        }
        Command::Import { file } => {
            let snapshot = CacheSnapshot::read_from_file(&file).await.map_err(|e| {
                Error::Config(format!("cannot load snapshot {}: {}", file.display(), e))
            })?;
            let total = snapshot.len();
            let imported = cache.import(snapshot).await;
            print_json(&json!({ "file": file, "entries": total, "imported": imported }))?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_set() {
        let args = Args::try_parse_from([
            "hearthcache", "set", "user:42", r#"{"name":"A"}"#, "--ttl", "1s", "--tag", "user:42",
        ])
        .unwrap();
        match args.command {
            Command::Set { key, ttl, tags, .. } => {
                assert_eq!(key, "user:42");
                assert_eq!(ttl.as_deref(), Some("1s"));
                assert_eq!(tags, vec!["user:42"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_invalidate_requires_tags() {
        assert!(Args::try_parse_from(["hearthcache", "invalidate"]).is_err());
    }
}
