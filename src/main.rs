//! s3nc-cache CLI
//!
//! Maintenance entry point for the s3-netcdf object cache: inspect, evict
//! and reset the cache shared by all sessions on this host.

use clap::{Parser, Subcommand};
use s3nc_cache::{CacheLookup, CacheStore, SessionConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "s3nc-cache")]
#[command(about = "Inspect and maintain the s3-netcdf local object cache", version)]
struct Cli {
    /// Path to config file (default: ~/.config/s3-netcdf/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Cache root, overriding config and S3_NETCDF_CACHE_DIR
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved cache root
    Root,

    /// Show entry count and total size
    Stats {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Check whether a URI is cached
    Lookup {
        /// Remote object URI, e.g. s3://bucket/file.nc
        uri: String,

        /// Expected integrity token (ETag)
        #[arg(long)]
        etag: Option<String>,
    },

    /// Apply the TTL and size policy
    Evict {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove one cached object
    Remove {
        /// Remote object URI
        uri: String,
    },

    /// Remove every cached object
    Clear,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let store = open_store(cli.config, cli.cache_dir);

    match cli.command {
        Commands::Root => run_root(&store),
        Commands::Stats { json } => run_stats(&store, json),
        Commands::Lookup { uri, etag } => run_lookup(&store, &uri, etag.as_deref()),
        Commands::Evict { json } => run_evict(&store, json),
        Commands::Remove { uri } => run_remove(&store, &uri),
        Commands::Clear => run_clear(&store),
    }
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("s3nc_cache=info,s3nc_store=info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config_path: Option<PathBuf>, cache_dir: Option<PathBuf>) -> CacheStore {
    let cli_overrides = cache_dir.map(|dir| serde_json::json!({ "cache": { "cache_root": dir.to_string_lossy() } }));

    let loaded = match SessionConfig::load(config_path.as_deref(), cli_overrides) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(2);
        }
    };
    debug!(sources = ?loaded.sources, "configuration loaded");

    // Maintenance works on the cache even when sessions have it turned off.
    let mut cache = loaded.config.cache;
    cache.enabled = true;

    let mut store = CacheStore::new(cache);
    if let Err(e) = store.init() {
        eprintln!("Cache unavailable: {}", e);
        process::exit(1);
    }
    store
}

fn run_root(store: &CacheStore) {
    if let Some(root) = store.root() {
        println!("{}", root.display());
    }
}

fn run_stats(store: &CacheStore, json: bool) {
    let stats = match store.stats() {
        Ok(stats) => stats,
        Err(e) => fail("Error reading cache", e),
    };

    if json {
        print_json(&stats);
        return;
    }

    println!(
        "Root:    {}",
        stats.root.as_ref().map(|r| r.display().to_string()).unwrap_or_default()
    );
    println!("Entries: {}", stats.entries);
    println!("Size:    {}", format_bytes(stats.total_bytes));
    if stats.max_size_bytes > 0 {
        println!("Limit:   {}", format_bytes(stats.max_size_bytes));
    } else {
        println!("Limit:   unlimited");
    }
}

fn run_lookup(store: &CacheStore, uri: &str, etag: Option<&str>) {
    match store.lookup(uri, etag) {
        CacheLookup::Hit { path, entry } => {
            println!("hit {}", path.display());
            println!("  size:           {}", format_bytes(entry.size_bytes));
            println!("  cached_at:      {}", entry.cached_at.to_rfc3339());
            println!("  last_validated: {}", entry.last_validated_at.to_rfc3339());
            if let Some(ref etag) = entry.integrity_token {
                println!("  etag:           {}", etag);
            }
        }
        CacheLookup::Miss(reason) => {
            println!("miss ({:?})", reason);
            process::exit(1);
        }
    }
}

fn run_evict(store: &CacheStore, json: bool) {
    let report = match store.evict() {
        Ok(report) => report,
        Err(e) => fail("Eviction failed", e),
    };

    if json {
        print_json(&report);
    } else {
        println!(
            "Removed {} expired, {} least-recently-used, {} corrupt, {} orphaned",
            report.expired, report.evicted_lru, report.corrupt_removed, report.orphans_removed
        );
        println!("Reclaimed {}", format_bytes(report.bytes_reclaimed));
        println!(
            "Remaining: {} entries, {}",
            report.remaining_entries,
            format_bytes(report.remaining_bytes)
        );
        if report.skipped_locked > 0 {
            println!("Skipped {} entries in use by another process", report.skipped_locked);
        }
        for error in &report.errors {
            eprintln!("warning: {}", error);
        }
    }
}

fn run_remove(store: &CacheStore, uri: &str) {
    match store.remove(uri) {
        Ok(true) => println!("Removed {}", uri),
        Ok(false) => println!("Not cached: {}", uri),
        Err(e) => fail("Remove failed", e),
    }
}

fn run_clear(store: &CacheStore) {
    if let Err(e) = store.clear() {
        fail("Clear failed", e);
    }
    println!("Cache cleared");
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail("Error serializing output", e),
    }
}

fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", context, err);
    process::exit(1);
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
