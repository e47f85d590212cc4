#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;

/// Outbound-first mail transfer agent
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file, overriding `POSTERN_CONFIG` and the default
    /// locations
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = find_config_file(args.config)?;
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let postern = postern::Postern::from_ron(&config_content)?;

    postern.run().await
}

/// Find the configuration file using the following precedence:
/// 1. `--config`
/// 2. `POSTERN_CONFIG` environment variable
/// 3. ./postern.config.ron (current working directory)
/// 4. /etc/postern/postern.config.ron (system-wide config)
fn find_config_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("--config points to non-existent file: {}", path.display());
    }

    if let Ok(env_path) = std::env::var("POSTERN_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "POSTERN_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./postern.config.ron"),
        PathBuf::from("/etc/postern/postern.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - POSTERN_CONFIG environment variable\n{paths_tried}"
    )
}
