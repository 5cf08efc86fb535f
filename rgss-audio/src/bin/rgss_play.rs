//! RGSS audio player - command-line entry point
//!
//! Plays BGM/BGS/ME/SE assets from a game directory through the full audio
//! engine, then resets it. Useful for checking assets and output devices.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rgss_audio::{Audio, AudioConfig};
use rgss_common::DirFileSystem;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for rgss-play
#[derive(Parser, Debug)]
#[command(name = "rgss-play")]
#[command(about = "Play RGSS audio assets through the runtime audio engine")]
#[command(version)]
struct Args {
    /// Game root folder assets are resolved against
    #[arg(short, long, default_value = ".", env = "RGSS_GAME_ROOT")]
    root: PathBuf,

    /// Background music to play on track 0
    #[arg(long)]
    bgm: Option<String>,

    /// Background sound to play
    #[arg(long)]
    bgs: Option<String>,

    /// Jingle to play once the music has started
    #[arg(long)]
    me: Option<String>,

    /// Sound effect to play (repeatable)
    #[arg(long)]
    se: Vec<String>,

    /// Number of BGM tracks (overrides the config file)
    #[arg(long)]
    tracks: Option<usize>,

    /// Run without audio hardware
    #[arg(long)]
    headless: bool,

    /// Seconds to play before resetting
    #[arg(long, default_value = "10")]
    seconds: u64,

    /// Config file (defaults to $RGSS_AUDIO_CONFIG or the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rgss_audio=info,rgss_play=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = AudioConfig::load(args.config.as_deref()).context("Failed to load audio config")?;
    if let Some(tracks) = args.tracks {
        config.bgm_tracks = tracks;
    }
    if args.headless {
        config.output.headless = true;
    }

    info!("Game root: {}", args.root.display());
    let fs = Arc::new(DirFileSystem::new(&args.root));
    let audio = Audio::new(config, fs).context("Failed to initialize audio")?;

    if let Some(bgm) = &args.bgm {
        audio
            .bgm_play(bgm, 100, 100, 0.0, 0)
            .with_context(|| format!("Failed to play BGM {}", bgm))?;
    }
    if let Some(bgs) = &args.bgs {
        audio
            .bgs_play(bgs, 80, 100, 0.0)
            .with_context(|| format!("Failed to play BGS {}", bgs))?;
    }
    if let Some(me) = &args.me {
        thread::sleep(Duration::from_secs(1));
        audio
            .me_play(me, 100, 100)
            .with_context(|| format!("Failed to play ME {}", me))?;
    }
    for se in &args.se {
        audio.se_play(se, 100, 100);
        thread::sleep(Duration::from_millis(300));
    }

    thread::sleep(Duration::from_secs(args.seconds));

    info!("BGM position at exit: {:.2}s", audio.bgm_pos(0)?);
    audio.reset();
    Ok(())
}
