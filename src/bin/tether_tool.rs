use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tetherkeep::storage::IMAGE_VERSION;
use tetherkeep::{EntityId, RegistryImage};

#[derive(Parser)]
#[command(name = "tether-tool")]
#[command(about = "Developer tooling for the bound entity storage file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print records, remaps and pending deletions.
    Inspect {
        file: PathBuf,
        /// Print the image as JSON instead of a listing.
        #[arg(long)]
        json: bool,
    },
    /// Check that the file decodes and every remap target has a record.
    Verify { file: PathBuf },
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { file, json } => inspect(&file, json),
        Command::Verify { file } => verify(&file),
        Command::Version => {
            println!("Bound entity image version: {}", IMAGE_VERSION);
            Ok(())
        }
    }
}

fn read_image(path: &Path) -> Result<RegistryImage> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    RegistryImage::decode(&bytes).with_context(|| format!("Failed to decode '{}'", path.display()))
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let image = read_image(path)?;

    if json {
        let rendered = serde_json::to_string_pretty(&image).context("Failed to render image as JSON")?;
        println!("{}", rendered);
        return Ok(());
    }

    println!("File: {}", path.display());
    println!("Version: {}", image.version);
    if let Some(saved_at) = image.saved_at {
        println!("Saved at: {}", saved_at.to_rfc3339());
    }

    println!("Records ({}):", image.entries.len());
    for entry in &image.entries {
        let id = entry
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<missing id>".to_string());
        let region = entry
            .region
            .as_ref()
            .map(|region| region.to_string())
            .unwrap_or_else(|| "<default>".to_string());
        let mut flags = Vec::new();
        if entry.resident {
            flags.push("resident".to_string());
        }
        if entry.deceased {
            flags.push("deceased".to_string());
        }
        if let Some(holder) = &entry.offline_holder {
            flags.push(format!("offline holder {}", holder));
        }
        println!(
            "- {} in {} at {} {} {} ({} state bytes) {}",
            id,
            region,
            entry.x,
            entry.y,
            entry.z,
            entry.state.len(),
            flags.join(", ")
        );
    }

    println!("Remaps ({}):", image.remaps.len());
    for pair in &image.remaps {
        println!("- {} -> {}", pair.original, pair.recreated);
    }

    println!("Pending deletions ({}):", image.pending_deletions.len());
    for id in &image.pending_deletions {
        println!("- {}", id);
    }
    Ok(())
}

fn verify(path: &Path) -> Result<()> {
    let image = read_image(path)?;
    let known: HashSet<EntityId> = image.entries.iter().filter_map(|entry| entry.id).collect();

    let mut issues = Vec::new();
    let missing_ids = image.entries.iter().filter(|entry| entry.id.is_none()).count();
    if missing_ids > 0 {
        issues.push(format!("{} entries carry no identity", missing_ids));
    }
    for pair in &image.remaps {
        if !known.contains(&pair.recreated) {
            issues.push(format!(
                "remap {} -> {} points at a missing record",
                pair.original, pair.recreated
            ));
        }
    }

    println!("File: {}", path.display());
    println!("Records: {}, remaps: {}", known.len(), image.remaps.len());
    if issues.is_empty() {
        println!("Integrity: OK");
        return Ok(());
    }

    println!("Integrity: FAILED");
    for issue in &issues {
        println!("- {}", issue);
    }
    Err(anyhow!("{} integrity issue(s) in '{}'", issues.len(), path.display()))
}
