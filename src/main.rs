mod app;
mod audio;
mod config;
mod error;
mod export;
mod hooks;
mod melody;
mod messages;
mod services;

use app::App;
use audio::BitDepth;
use audio::mixer::{MixGains, combine_to_wav};
use config::Config;
use export::ExportFormat;
use melody::Melody;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Record vocal takes against a guide melody
#[derive(Parser, Debug)]
#[command(name = "ghostnote", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record takes interactively while the melody plays
    Record {
        /// Melody JSON file
        melody: PathBuf,

        /// Take number used in exported file names
        #[arg(long)]
        take: Option<u32>,
    },

    /// Render the guide melody to a WAV file
    Render {
        melody: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Mix a recorded take with a guide track into one WAV file
    Mix {
        primary: PathBuf,
        guide: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        primary_gain: Option<f32>,

        #[arg(long)]
        guide_gain: Option<f32>,

        /// 8, 16, 24 or 32
        #[arg(long)]
        bit_depth: Option<u16>,
    },

    /// Print the melody as ABC notation
    Abc { melody: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Command::Record { melody, take } => {
            let melody = Melody::load(&melody)?;

            // LocalSet for !Send futures (the session holds cpal and rodio streams)
            let local = tokio::task::LocalSet::new();
            local
                .run_until(async move { App::new(config, melody, take).await?.run().await })
                .await
        }
        Command::Render { melody, output } => render(&config, &melody, output).await,
        Command::Mix {
            primary,
            guide,
            output,
            primary_gain,
            guide_gain,
            bit_depth,
        } => {
            let gains = MixGains::new(
                primary_gain.unwrap_or(config.primary_gain),
                guide_gain.unwrap_or(config.guide_gain),
            );
            let bit_depth = match bit_depth {
                Some(bits) => BitDepth::try_from(bits)?,
                None => config.bit_depth()?,
            };
            mix(&config, &primary, &guide, output, gains, bit_depth).await
        }
        Command::Abc { melody } => {
            let melody = Melody::load(&melody)?;
            print!("{}", melody.to_abc());
            Ok(())
        }
    }
}

async fn render(config: &Config, melody_path: &Path, output: Option<PathBuf>) -> Result<()> {
    let melody = Melody::load(melody_path)?;
    let wav = export::render_guide_wav(&melody, config.sample_rate, config.bit_depth()?)?;

    let path = match output {
        Some(path) => {
            tokio::fs::write(&path, &wav)
                .await
                .with_context(|| format!("Failed to write {:?}", path))?;
            path
        }
        None => {
            let title = format!("{} guide", melody.title);
            let filename = export::generate_filename(
                Some(&title),
                None,
                ExportFormat::Wav,
                chrono::Local::now().date_naive(),
            );
            export::save_export(&config.output_dir, &filename, &wav)?
        }
    };

    tracing::info!("Rendered '{}' to {:?}", melody.title, path);
    run_hook(config, &path).await;
    Ok(())
}

async fn mix(
    config: &Config,
    primary: &Path,
    guide: &Path,
    output: Option<PathBuf>,
    gains: MixGains,
    bit_depth: BitDepth,
) -> Result<()> {
    let primary_bytes = tokio::fs::read(primary)
        .await
        .with_context(|| format!("Failed to read {:?}", primary))?;
    let guide_bytes = tokio::fs::read(guide)
        .await
        .with_context(|| format!("Failed to read {:?}", guide))?;

    let mixed = tokio::task::spawn_blocking({
        let sample_rate = config.sample_rate;
        move || combine_to_wav(&primary_bytes, &guide_bytes, gains, sample_rate, bit_depth)
    })
    .await??;

    let path = match output {
        Some(path) => path,
        None => {
            let stem = primary
                .file_stem()
                .map(|s| format!("{} mix", s.to_string_lossy()));
            config.output_dir.join(export::generate_filename(
                stem.as_deref(),
                None,
                ExportFormat::Wav,
                chrono::Local::now().date_naive(),
            ))
        }
    };

    let dir = path.parent().unwrap_or(Path::new("."));
    let filename = path
        .file_name()
        .context("Output path has no file name")?
        .to_string_lossy();
    let path = export::save_export(dir, &filename, &mixed)?;

    tracing::info!("Mixed {:?} and {:?} into {:?}", primary, guide, path);
    run_hook(config, &path).await;
    Ok(())
}

/// One-shot commands wait for the hook so it is not cut off at exit
async fn run_hook(config: &Config, path: &Path) {
    if let Some(hook) = &config.post_export_hook {
        if let Err(e) = hooks::run_export_hook(hook, path).await {
            tracing::warn!("Export hook task failed: {}", e);
        }
    }
}
