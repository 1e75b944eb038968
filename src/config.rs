use anyhow::Context;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};

use crate::{
    color::Rgb,
    error::ShowcaseError,
    model::NowPlayingItem,
    palette::DEFAULT_FALLBACK,
};

const CONFIG_FILE_NAMES: [&str; 2] = ["showcase.toml", "config.toml"];

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub facts: FactsConfig,
    pub notes: NotesConfig,
    pub artwork: ArtworkConfig,
    pub palette: PaletteConfig,
    pub now_playing: NowPlayingItem,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            facts: FactsConfig::default(),
            notes: NotesConfig::default(),
            artwork: ArtworkConfig::default(),
            palette: PaletteConfig::default(),
            now_playing: default_now_playing(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        match Self::discover() {
            Some(path) => Self::load_from(&path),
            None => Ok(Config::default()),
        }
    }

    pub fn discover() -> Option<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = env::current_dir() {
            for name in CONFIG_FILE_NAMES {
                candidates.push(current_dir.join(name));
                candidates.push(current_dir.join("config").join(name));
            }
        }

        if let Ok(exe) = env::current_exe() {
            if let Some(dir) = exe.parent() {
                for name in CONFIG_FILE_NAMES {
                    candidates.push(dir.join(name));
                    candidates.push(dir.join("config").join(name));
                }
            }
        }

        candidates.into_iter().find(|path| path.exists())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&data)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn from_toml_str(data: &str) -> anyhow::Result<Self> {
        let doc: ConfigDocument = toml::from_str(data)?;
        Ok(Config::try_from(doc)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactsConfig {
    pub initial_batch: usize,
    pub top_up_batch: usize,
    pub prefetch_threshold: usize,
}

impl Default for FactsConfig {
    fn default() -> Self {
        Self {
            initial_batch: 10,
            top_up_batch: 8,
            prefetch_threshold: 3,
        }
    }
}

impl FactsConfig {
    pub fn initial_batch(&self) -> usize {
        self.initial_batch.clamp(1, 100)
    }

    pub fn top_up_batch(&self) -> usize {
        self.top_up_batch.clamp(1, 100)
    }

    pub fn prefetch_threshold(&self) -> usize {
        self.prefetch_threshold.min(100)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotesConfig {
    pub enabled: bool,
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
    pub dwell_secs: f64,
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: 45.0,
            max_interval_secs: 70.0,
            dwell_secs: 10.0,
        }
    }
}

impl NotesConfig {
    pub fn interval_range(&self) -> (f64, f64) {
        let a = self.min_interval_secs.max(1.0);
        let b = self.max_interval_secs.max(1.0);
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// `None` keeps a note up until the next one replaces it.
    pub fn dwell(&self) -> Option<Duration> {
        (self.dwell_secs > 0.0).then(|| Duration::from_secs_f64(self.dwell_secs.min(600.0)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtworkConfig {
    pub max_candidates: usize,
    pub directory: Option<PathBuf>,
}

impl Default for ArtworkConfig {
    fn default() -> Self {
        Self {
            max_candidates: 4,
            directory: None,
        }
    }
}

impl ArtworkConfig {
    pub fn max_candidates(&self) -> usize {
        self.max_candidates.clamp(1, 16)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaletteConfig {
    pub min_cycle_secs: f64,
    pub max_cycle_secs: f64,
    pub fallback_start: Rgb,
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self {
            min_cycle_secs: 15.0,
            max_cycle_secs: 20.0,
            fallback_start: DEFAULT_FALLBACK,
        }
    }
}

impl PaletteConfig {
    pub fn cycle_range(&self) -> (f64, f64) {
        let a = self.min_cycle_secs.max(1.0);
        let b = self.max_cycle_secs.max(1.0);
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    pub fn spawn<F>(path: impl Into<PathBuf>, on_change: F) -> anyhow::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let path = path.into();
        let file_name = path.file_name().map(|name| name.to_os_string());
        let watch_dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    let relevant = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        debug!("config file changed");
                        on_change();
                    }
                }
                Err(err) => warn!("Config watcher error: {err}"),
            }
        })
        .context("Failed to create config watcher")?;
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", watch_dir.display()))?;

        Ok(Self {
            _watcher: watcher,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    facts: FactsSection,
    #[serde(default)]
    notes: NotesSection,
    #[serde(default)]
    artwork: ArtworkSection,
    #[serde(default)]
    palette: PaletteSection,
    #[serde(default)]
    now_playing: NowPlayingSection,
}

impl TryFrom<ConfigDocument> for Config {
    type Error = ShowcaseError;

    fn try_from(value: ConfigDocument) -> Result<Self, Self::Error> {
        let facts_default = FactsConfig::default();
        let notes_default = NotesConfig::default();
        let artwork_default = ArtworkConfig::default();
        let palette_default = PaletteConfig::default();

        let fallback_start = match value.palette.fallback_start.as_deref() {
            Some(raw) => Rgb::parse(raw)
                .map_err(|err| ShowcaseError::config(format!("palette.fallback_start: {err}")))?,
            None => palette_default.fallback_start,
        };

        let placeholder = default_now_playing();
        let now_playing = NowPlayingItem {
            title: value.now_playing.title.unwrap_or(placeholder.title),
            artist: value.now_playing.artist.unwrap_or(placeholder.artist),
            album: value.now_playing.album.unwrap_or(placeholder.album),
            release_year: value.now_playing.year.or(placeholder.release_year),
        };

        Ok(Config {
            facts: FactsConfig {
                initial_batch: value.facts.initial_batch.unwrap_or(facts_default.initial_batch),
                top_up_batch: value.facts.top_up_batch.unwrap_or(facts_default.top_up_batch),
                prefetch_threshold: value
                    .facts
                    .prefetch_threshold
                    .unwrap_or(facts_default.prefetch_threshold),
            },
            notes: NotesConfig {
                enabled: value.notes.enabled.unwrap_or(notes_default.enabled),
                min_interval_secs: value
                    .notes
                    .min_interval_secs
                    .unwrap_or(notes_default.min_interval_secs),
                max_interval_secs: value
                    .notes
                    .max_interval_secs
                    .unwrap_or(notes_default.max_interval_secs),
                dwell_secs: value.notes.dwell_secs.unwrap_or(notes_default.dwell_secs),
            },
            artwork: ArtworkConfig {
                max_candidates: value
                    .artwork
                    .max_candidates
                    .unwrap_or(artwork_default.max_candidates),
                directory: value.artwork.directory.or(artwork_default.directory),
            },
            palette: PaletteConfig {
                min_cycle_secs: value
                    .palette
                    .min_cycle_secs
                    .unwrap_or(palette_default.min_cycle_secs),
                max_cycle_secs: value
                    .palette
                    .max_cycle_secs
                    .unwrap_or(palette_default.max_cycle_secs),
                fallback_start,
            },
            now_playing,
        })
    }
}

pub fn default_now_playing() -> NowPlayingItem {
    NowPlayingItem::new("Get Lucky", "Daft Punk", "Random Access Memories", Some(2013))
}

#[derive(Debug, Default, Deserialize)]
struct FactsSection {
    initial_batch: Option<usize>,
    top_up_batch: Option<usize>,
    prefetch_threshold: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct NotesSection {
    enabled: Option<bool>,
    min_interval_secs: Option<f64>,
    max_interval_secs: Option<f64>,
    dwell_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ArtworkSection {
    max_candidates: Option<usize>,
    directory: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct PaletteSection {
    min_cycle_secs: Option<f64>,
    max_cycle_secs: Option<f64>,
    fallback_start: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NowPlayingSection {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    year: Option<i32>,
}
