use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use autopsy::cache::{CleanupOutcome, CleanupTarget, EnsureError, SnapshotCache};
use autopsy::config::CacheConfig;
use autopsy::reference::parse_reference;

/// Exit status after Ctrl-C, as a shell would report SIGINT.
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "autopsy",
    about = "Repo autopsy - cached local snapshots of remote repositories"
)]
struct Cli {
    /// Cache root (defaults to the system cache dir + "repo-autopsy")
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Seconds a sync stays fresh
    #[arg(long, global = true)]
    freshness_secs: Option<u64>,

    /// History depth for new clones
    #[arg(long, global = true)]
    depth: Option<u32>,

    /// Load and save sync times at <cache-dir>/.index.json
    #[arg(long, global = true)]
    persist_index: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Make sure a fresh snapshot exists and print its path
    Ensure {
        /// owner/name, https URL or git@host:owner/name
        repo: String,

        /// Sync even if the snapshot is still fresh
        #[arg(long)]
        refresh: bool,

        /// Print the snapshot handle as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove one snapshot, or all of them
    Cleanup {
        /// Repository reference, or "all"
        target: String,
    },

    /// List cached snapshots
    List,

    /// Show how a reference is interpreted
    Parse {
        /// Repository reference
        repo: String,
    },

    /// Check dependencies
    Doctor,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = build_config(&cli);

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        log::warn!("failed to install Ctrl-C handler: {}", e);
    }

    let result = match &cli.command {
        Commands::Ensure {
            repo,
            refresh,
            json,
        } => cmd_ensure(&config, repo, *refresh, *json, &cancel).await,
        Commands::Cleanup { target } => cmd_cleanup(&config, target).await,
        Commands::List => cmd_list(&config),
        Commands::Parse { repo } => cmd_parse(repo),
        Commands::Doctor => cmd_doctor(&config),
    };

    if let Err(e) = result {
        if e.downcast_ref::<EnsureError>().is_some_and(EnsureError::is_cancelled) {
            eprintln!("Cancelled");
            std::process::exit(EXIT_CANCELLED);
        }
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn build_config(cli: &Cli) -> CacheConfig {
    let mut config = CacheConfig::default();
    if let Some(dir) = &cli.cache_dir {
        config = config.with_root(dir);
    }
    if let Some(secs) = cli.freshness_secs {
        config = config.with_freshness_window(Duration::from_secs(secs));
    }
    if let Some(depth) = cli.depth {
        config = config.with_clone_depth(depth);
    }
    if cli.persist_index {
        config = config.with_persisted_index();
    }
    config
}

async fn cmd_ensure(
    config: &CacheConfig,
    repo: &str,
    refresh: bool,
    json: bool,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = SnapshotCache::new(config)?;
    let handle = cache.ensure(repo, cancel, refresh).await?;
    cache.save_index()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&handle)?);
        return Ok(());
    }

    println!(
        "Repo ready at: {} ({})",
        handle.path.display(),
        if handle.served_from_cache {
            "cached"
        } else {
            "fetched"
        }
    );
    if let Some(commit) = &handle.commit {
        println!("  Commit: {}", short_commit(commit));
    }

    Ok(())
}

async fn cmd_cleanup(
    config: &CacheConfig,
    target: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let target: CleanupTarget = target
        .parse()
        .map_err(|e| format!("Invalid repo format: {}", e))?;

    let cache = SnapshotCache::new(config)?;
    let outcome = cache.cleanup(&target).await?;
    // Clearing everything took the index file with it.
    if !matches!(outcome, CleanupOutcome::ClearedAll(_)) {
        cache.save_index()?;
    }

    println!("{}", outcome);
    Ok(())
}

fn cmd_list(config: &CacheConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cache = SnapshotCache::new(config)?;
    let snapshots = cache.list()?;

    if snapshots.is_empty() {
        println!("No repositories cached");
        return Ok(());
    }

    println!("{:<40} {:>6} {:>15}", "REPO", "GIT", "LAST SYNC");
    println!("{}", "-".repeat(63));

    let now = SystemTime::now();
    for snapshot in snapshots {
        let last_sync = snapshot
            .last_synced_at
            .map(|at| {
                let age = now.duration_since(at).unwrap_or_default();
                format!("{} ago", format_duration(age.as_secs()))
            })
            .unwrap_or_else(|| "unknown".to_string());

        println!(
            "{:<40} {:>6} {:>15}",
            snapshot.key.to_string(),
            if snapshot.is_repository { "yes" } else { "no" },
            last_sync
        );
    }

    Ok(())
}

fn cmd_parse(repo: &str) -> Result<(), Box<dyn std::error::Error>> {
    let reference = parse_reference(repo)?;

    println!("Key:       {}", reference.key);
    println!("Host:      {}", reference.host);
    println!("Clone URL: {}", reference.clone_url);
    println!("Form:      {:?}", reference.form);

    Ok(())
}

fn cmd_doctor(config: &CacheConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Repo Autopsy System Check\n");

    // Check git
    let git_version = std::process::Command::new(&config.git_path)
        .args(["--version"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());
    println!(
        "[{}] git: {}",
        if git_version.is_some() { "OK" } else { "FAIL" },
        git_version.as_deref().unwrap_or("not found")
    );

    // Check cache directory
    let cache_ok = config.root.exists();
    println!(
        "[{}] Cache dir: {}",
        if cache_ok { "OK" } else { "INFO" },
        config.root.display()
    );

    println!(
        "[INFO] Freshness window: {}",
        format_duration(config.freshness_window.as_secs())
    );
    println!("[INFO] Clone depth: {}", config.clone_depth);

    if let Some(index_file) = &config.index_file {
        println!(
            "[{}] Index file: {}",
            if index_file.exists() { "OK" } else { "INFO" },
            index_file.display()
        );
    }

    if git_version.is_none() {
        std::process::exit(1);
    }

    Ok(())
}

fn short_commit(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}
