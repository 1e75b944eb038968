use anyhow::{Context, Result};
use futures::future::{self, BoxFuture, FutureExt};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, info};

use crate::{
    config::Config,
    model::{EditorialNote, Fact, FactSubject, NowPlayingItem},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactQuery {
    pub artist: String,
    pub album: String,
    pub year: Option<i32>,
    pub max: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtworkQuery {
    pub artist: String,
    pub album: String,
    pub title: String,
}

impl ArtworkQuery {
    pub fn for_item(item: &NowPlayingItem) -> Self {
        Self {
            artist: item.artist.clone(),
            album: item.album.clone(),
            title: item.title.clone(),
        }
    }

    fn cache_key(&self) -> String {
        [&self.artist, &self.album, &self.title]
            .iter()
            .map(|part| part.trim().to_lowercase())
            .collect::<Vec<_>>()
            .join("|")
    }
}

pub trait FactsSource: Send + Sync {
    fn fetch_facts(&self, query: FactQuery) -> BoxFuture<'_, Result<Vec<Fact>>>;
}

pub trait EditorialSource: Send + Sync {
    fn current_note(&self) -> BoxFuture<'_, Option<EditorialNote>>;
}

pub trait NowPlayingSource: Send + Sync {
    fn current_item(&self) -> BoxFuture<'_, Result<Option<NowPlayingItem>>>;

    /// One-time authorization; calling it again after success is a no-op.
    fn request_access_if_needed(&self) -> BoxFuture<'_, Result<()>>;
}

pub trait ArtworkSource: Send + Sync {
    fn fetch_primary(&self, query: ArtworkQuery) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;

    /// Best effort: may return fewer than `max` images, or none.
    fn fetch_candidates(&self, query: ArtworkQuery, max: usize)
        -> BoxFuture<'_, Result<Vec<Vec<u8>>>>;
}

pub trait ConfigSource: Send + Sync {
    /// `Ok(None)` means nothing newer than the built-in defaults is available.
    fn fetch(&self) -> BoxFuture<'_, Result<Option<Config>>>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub facts: Arc<dyn FactsSource>,
    pub editorial: Arc<dyn EditorialSource>,
    pub now_playing: Arc<dyn NowPlayingSource>,
    pub artwork: Arc<dyn ArtworkSource>,
    pub config: Arc<dyn ConfigSource>,
}

impl Collaborators {
    pub fn demo(config: &Config, config_path: Option<PathBuf>) -> Self {
        Self {
            facts: Arc::new(DemoFacts),
            editorial: Arc::new(DemoEditorial::default()),
            now_playing: Arc::new(StaticNowPlaying::new(Some(config.now_playing.clone()))),
            artwork: Arc::new(DirectoryArtwork::new(
                config.artwork.directory.clone().unwrap_or_default(),
            )),
            config: Arc::new(FileConfigSource::new(config_path)),
        }
    }
}

const FACT_TEMPLATES: [&str; 8] = [
    "{artist} released {album}{in_year}.",
    "The album {album} blends electronic textures with live instrumentation.",
    "{artist} drew inspiration from 70s/80s studio techniques on {album}.",
    "Fun tidbit: {album} features multiple collaborators across genres.",
    "Fans often cite {album} as a late-night headphone record.",
    "A standout track on {album} showcases lush analog synths.",
    "{artist}'s production style emphasizes groove and atmosphere.",
    "The sequencing of {album} encourages front-to-back listening.",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct DemoFacts;

impl DemoFacts {
    pub fn generate(query: &FactQuery) -> Vec<Fact> {
        let in_year = query
            .year
            .map(|year| format!(" in {year}"))
            .unwrap_or_default();
        (0..query.max)
            .map(|idx| {
                let text = FACT_TEMPLATES[idx % FACT_TEMPLATES.len()]
                    .replace("{artist}", &query.artist)
                    .replace("{album}", &query.album)
                    .replace("{in_year}", &in_year);
                let subject = if idx % 2 == 0 {
                    FactSubject::Artist
                } else {
                    FactSubject::Album
                };
                Fact::new(text, subject, Some("demo".to_string()))
            })
            .collect()
    }
}

impl FactsSource for DemoFacts {
    fn fetch_facts(&self, query: FactQuery) -> BoxFuture<'_, Result<Vec<Fact>>> {
        future::ready(Ok(Self::generate(&query))).boxed()
    }
}

#[derive(Debug, Clone)]
pub struct DemoEditorial {
    text: String,
}

impl Default for DemoEditorial {
    fn default() -> Self {
        Self {
            text: "A thoughtful, human-written blurb about this album.".to_string(),
        }
    }
}

impl DemoEditorial {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl EditorialSource for DemoEditorial {
    fn current_note(&self) -> BoxFuture<'_, Option<EditorialNote>> {
        future::ready(Some(EditorialNote::new(self.text.clone()))).boxed()
    }
}

#[derive(Debug, Default)]
pub struct StaticNowPlaying {
    item: Mutex<Option<NowPlayingItem>>,
    authorized: AtomicBool,
}

impl StaticNowPlaying {
    pub fn new(item: Option<NowPlayingItem>) -> Self {
        Self {
            item: Mutex::new(item),
            authorized: AtomicBool::new(false),
        }
    }

    pub fn set_item(&self, item: Option<NowPlayingItem>) {
        if let Ok(mut guard) = self.item.lock() {
            *guard = item;
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }
}

impl NowPlayingSource for StaticNowPlaying {
    fn current_item(&self) -> BoxFuture<'_, Result<Option<NowPlayingItem>>> {
        let item = self
            .item
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| anyhow::anyhow!("now-playing state poisoned"));
        future::ready(item).boxed()
    }

    fn request_access_if_needed(&self) -> BoxFuture<'_, Result<()>> {
        if !self.authorized.swap(true, Ordering::SeqCst) {
            info!("now-playing access granted");
        }
        future::ready(Ok(())).boxed()
    }
}

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "bmp", "webp"];

pub struct DirectoryArtwork {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl DirectoryArtwork {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn image_files(&self) -> Result<Vec<PathBuf>> {
        if self.dir.as_os_str().is_empty() || !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list artwork directory: {}", self.dir.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    IMAGE_EXTENSIONS
                        .iter()
                        .any(|known| ext.eq_ignore_ascii_case(known))
                })
                .unwrap_or(false);
            if is_image {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_cached(&self, key: String, path: &Path) -> Result<Vec<u8>> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(bytes) = cache.get(&key) {
                return Ok(bytes.as_ref().clone());
            }
        }
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read artwork: {}", path.display()))?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, Arc::new(bytes.clone()));
        }
        Ok(bytes)
    }

    fn primary(&self, query: &ArtworkQuery) -> Result<Option<Vec<u8>>> {
        let files = self.image_files()?;
        let album = query.album.trim().to_lowercase();
        let chosen = files
            .iter()
            .find(|path| {
                !album.is_empty()
                    && path
                        .file_stem()
                        .map(|stem| stem.to_string_lossy().to_lowercase().contains(&album))
                        .unwrap_or(false)
            })
            .or_else(|| files.first());
        match chosen {
            Some(path) => {
                debug!(path = %path.display(), "primary artwork");
                self.read_cached(query.cache_key(), path).map(Some)
            }
            None => Ok(None),
        }
    }

    fn candidates(&self, query: &ArtworkQuery, max: usize) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for path in self.image_files()?.into_iter().take(max) {
            let key = format!("{}|{}", query.cache_key(), path.display());
            match self.read_cached(key, &path) {
                Ok(bytes) => out.push(bytes),
                Err(err) => debug!("skipping artwork candidate: {err:#}"),
            }
        }
        Ok(out)
    }
}

impl ArtworkSource for DirectoryArtwork {
    fn fetch_primary(&self, query: ArtworkQuery) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        future::ready(self.primary(&query)).boxed()
    }

    fn fetch_candidates(
        &self,
        query: ArtworkQuery,
        max: usize,
    ) -> BoxFuture<'_, Result<Vec<Vec<u8>>>> {
        future::ready(self.candidates(&query, max)).boxed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileConfigSource {
    path: Option<PathBuf>,
}

impl FileConfigSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl ConfigSource for FileConfigSource {
    fn fetch(&self) -> BoxFuture<'_, Result<Option<Config>>> {
        let result = match self.path.clone().or_else(Config::discover) {
            Some(path) => Config::load_from(&path).map(Some),
            None => Ok(None),
        };
        future::ready(result).boxed()
    }
}
