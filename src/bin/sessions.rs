use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

use bonecap::animation::{AnimationStore, BoneId};
use bonecap::config::Config;

const CONFIG_PATH: &str = "config.toml";

#[derive(Parser)]
#[command(name = "sessions")]
#[command(about = "Inspect recorded animation sessions")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    #[arg(long, global = true, default_value = CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored sessions (newest last)
    List,

    /// Summarize one session
    Show {
        /// Session identifier (default: most recent)
        id: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config);
    let store = AnimationStore::from_config(&config.recording);

    match cli.command {
        Commands::List => {
            let ids = store.list_by_recency();
            if ids.is_empty() {
                println!("{} にセッションがありません", store.root().display());
            }
            for id in ids {
                match store.read(&id) {
                    Ok(session) => println!("{}  {} frames", id, session.len()),
                    Err(e) => println!("{}  (読めません: {})", id, e),
                }
            }
        }
        Commands::Show { id } => {
            let id = match id {
                Some(id) => id,
                None => store
                    .latest()
                    .with_context(|| format!("no sessions in {}", store.root().display()))?,
            };
            let session = store.read(&id)?;
            let threshold = config.reconstruction.visibility_threshold;

            println!("=== {} ===", id);
            if let Some(started_at) = session.started_at {
                println!("  開始: {}", started_at);
            }
            println!("  フレーム数: {}", session.len());
            if let Some((lo, hi)) = session.value_range(threshold) {
                println!("  座標範囲: {:.3} .. {:.3}", lo, hi);
            }

            // ボーンごとの可視フレーム数
            let mut visible: BTreeMap<BoneId, usize> = BTreeMap::new();
            for frame in &session.frames {
                for (bone, sample) in &frame.bones {
                    if sample.visibility >= threshold {
                        *visible.entry(*bone).or_default() += 1;
                    }
                }
            }
            for (bone, count) in visible {
                println!("  {:<12} {}/{}", bone.name(), count, session.len());
            }
        }
    }

    Ok(())
}
