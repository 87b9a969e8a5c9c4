//! EmberKV command-line tool.
//!
//! Operates on a flash image stored in a regular file, so a device's
//! partition dump can be inspected and edited off-target.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use flash::FileFlash;
use store::{FormatSet, Store, StoreConfig, StoreError};

/// EmberKV flash image tool
#[derive(Parser, Debug)]
#[command(name = "ember")]
#[command(about = "Key-value store over a flash image file")]
#[command(version)]
struct Args {
    /// Flash image path (created if missing)
    #[arg(short, long, default_value = "ember.img")]
    image: PathBuf,

    /// Number of sectors in the image
    #[arg(long, default_value = "16")]
    sectors: usize,

    /// Sector size in bytes
    #[arg(long, default_value = "4096")]
    sector_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the value stored under a key
    Get { key: String },

    /// Store a key-value pair
    Set { key: String, value: String },

    /// Delete a key
    Del { key: String },

    /// List all live keys
    Ls,

    /// Print space accounting and repair counters
    Stats,

    /// Reclaim one sector's worth of stale records
    Gc,

    /// Run store repair
    Repair,
}

fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let flash = FileFlash::open_or_create(&args.image, args.sectors, args.sector_size)
        .with_context(|| format!("opening image {}", args.image.display()))?;
    let mut store = Store::new(flash, FormatSet::default(), StoreConfig::default())
        .map_err(|e| anyhow!("store construction failed: {e}"))?;

    match store.init() {
        Ok(()) => {}
        // The store stays usable for surviving keys; say so and continue.
        Err(StoreError::DataLoss) => {
            tracing::warn!("image holds corrupt data; some keys may be missing")
        }
        Err(error) => return Err(anyhow!("init failed: {error}")),
    }

    match args.command {
        Commands::Get { key } => {
            let mut buf = vec![0u8; args.sector_size];
            let n = store
                .get(key.as_bytes(), &mut buf, 0)
                .map_err(|e| anyhow!("get failed: {e}"))?;
            match std::str::from_utf8(&buf[..n]) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{:?}", &buf[..n]),
            }
        }
        Commands::Set { key, value } => {
            store
                .put(key.as_bytes(), value.as_bytes())
                .map_err(|e| anyhow!("set failed: {e}"))?;
            println!("OK");
        }
        Commands::Del { key } => {
            store
                .delete(key.as_bytes())
                .map_err(|e| anyhow!("del failed: {e}"))?;
            println!("OK");
        }
        Commands::Ls => {
            for item in store.iter() {
                let key = item.key().map_err(|e| anyhow!("key read failed: {e}"))?;
                let size = item.value_size().unwrap_or(0);
                match std::str::from_utf8(&key) {
                    Ok(text) => println!("{text}\t{size}"),
                    Err(_) => println!("{key:?}\t{size}"),
                }
            }
        }
        Commands::Stats => {
            let stats = store.storage_stats();
            println!("keys:            {}", store.len());
            println!("in use:          {} B", stats.in_use_bytes);
            println!("reclaimable:     {} B", stats.reclaimable_bytes);
            println!("writable:        {} B", stats.writable_bytes);
            println!("sectors repaired:{}", stats.corrupt_sectors_recovered);
            println!(
                "copies restored: {}",
                stats.missing_redundant_entries_recovered
            );
        }
        Commands::Gc => match store.garbage_collect() {
            Ok(()) => println!("OK"),
            Err(StoreError::NotFound) => println!("nothing to reclaim"),
            Err(error) => return Err(anyhow!("gc failed: {error}")),
        },
        Commands::Repair => {
            store.repair().map_err(|e| anyhow!("repair failed: {e}"))?;
            println!("OK");
        }
    }

    Ok(())
}
