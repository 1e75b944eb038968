use std::{
    path::PathBuf,
    sync::mpsc::RecvTimeoutError,
    time::{Duration, Instant},
};

use ambient_showcase::{
    scheduler::StateChange, Collaborators, Config, EngineOptions, NowPlayingItem, Showcase,
};
use anyhow::{bail, Context as _};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "showcase", version, about = "Ambient now-playing showcase")]
struct Cli {
    /// Config file (TOML). Defaults to the first showcase.toml/config.toml found.
    #[arg(long)]
    config: Option<PathBuf>,

    /// How long to run before exiting.
    #[arg(long, default_value_t = 60)]
    seconds: u64,

    /// Pretend this is playing: "artist|album" or "artist|album|year".
    #[arg(long, value_parser = parse_simulated)]
    simulate: Option<NowPlayingItem>,

    /// Folder of artwork images, overriding `artwork.directory`.
    #[arg(long)]
    artwork_dir: Option<PathBuf>,

    /// Seed for every random draw, for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Reload the config file whenever it changes.
    #[arg(long)]
    watch: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = cli.config.clone().or_else(Config::discover);
    let mut config = match &config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    if let Some(dir) = cli.artwork_dir {
        config.artwork.directory = Some(dir);
    }

    let collaborators = Collaborators::demo(&config, config_path.clone());
    let options = EngineOptions {
        seed: cli.seed,
        watch_config: if cli.watch { config_path } else { None },
    };
    if cli.watch && options.watch_config.is_none() {
        warn!("--watch given but no config file was found");
    }

    let mut showcase =
        Showcase::spawn_with(config, collaborators, options).context("Failed to start showcase")?;
    let events = showcase.subscribe();
    showcase.start();
    if let Some(item) = cli.simulate {
        showcase.simulate_now_playing(item);
    }

    let deadline = Instant::now() + Duration::from_secs(cli.seconds);
    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(wait) {
            Ok(change) => log_change(&change),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("showcase engine stopped early");
                break;
            }
        }
    }

    let snapshot = showcase.snapshot();
    info!(
        track = %snapshot.track,
        queued_facts = snapshot.queued_facts,
        palettes = snapshot.palette_count,
        "shutting down"
    );
    showcase.shutdown();
    Ok(())
}

fn log_change(change: &StateChange) {
    match change {
        StateChange::TrackChanged(item) => info!(track = %item, "now playing"),
        StateChange::FactShown { fact, lane } => {
            info!(%lane, subject = fact.subject.as_str(), "fact: {}", fact.text)
        }
        StateChange::FactHidden => info!("fact hidden"),
        StateChange::NoteShown { note, lane } => info!(%lane, "note: {}", note.text),
        StateChange::NoteHidden => info!("note hidden"),
        StateChange::InterstitialShown { index } => info!(index, "artwork interstitial"),
        StateChange::InterstitialHidden => info!("interstitial hidden"),
        StateChange::PaletteChanged { palette, count } => {
            info!(start = %palette.start, end = %palette.end, count, "palette")
        }
        StateChange::ArtworkUpdated { candidates } => info!(candidates, "artwork updated"),
    }
}

fn parse_simulated(value: &str) -> anyhow::Result<NowPlayingItem> {
    let parts: Vec<&str> = value.split('|').map(str::trim).collect();
    let (artist, album, year) = match parts.as_slice() {
        [artist, album] => (*artist, *album, None),
        [artist, album, year] => {
            let year = year
                .parse::<i32>()
                .with_context(|| format!("invalid year: {year}"))?;
            (*artist, *album, Some(year))
        }
        _ => bail!("expected \"artist|album\" or \"artist|album|year\""),
    };
    if artist.is_empty() || album.is_empty() {
        bail!("artist and album must not be empty");
    }
    Ok(NowPlayingItem::new("", artist, album, year))
}
