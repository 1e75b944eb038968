use futures::executor::block_on;
use image::RgbaImage;
use rand::{rngs::StdRng, SeedableRng};
use std::{
    collections::hash_map::DefaultHasher,
    collections::HashSet,
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::{Config, ConfigWatcher},
    cycler::PaletteCycler,
    error::{ShowcaseError, ShowcaseResult},
    model::NowPlayingItem,
    palette::{decode_artwork, ColorClusterer, Palette},
    scheduler::{
        ArtworkBundle, ContentScheduler, FetchRequest, FetchResult, ShowcaseSnapshot, StateChange,
    },
    sources::{ArtworkQuery, Collaborators},
};

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub seed: Option<u64>,
    pub watch_config: Option<PathBuf>,
}

enum Command {
    Start,
    Simulate(NowPlayingItem),
    RefreshConfig,
    Subscribe(Sender<StateChange>),
    Completed(FetchResult),
    Shutdown,
}

/// Handle to a running showcase engine. Dropping it stops the engine.
pub struct Showcase {
    commands: Sender<Command>,
    snapshot: Arc<Mutex<ShowcaseSnapshot>>,
    engine: Option<JoinHandle<()>>,
    _watcher: Option<ConfigWatcher>,
}

impl Showcase {
    pub fn spawn(config: Config, collaborators: Collaborators) -> anyhow::Result<Self> {
        Self::spawn_with(config, collaborators, EngineOptions::default())
    }

    pub fn spawn_with(
        config: Config,
        collaborators: Collaborators,
        options: EngineOptions,
    ) -> anyhow::Result<Self> {
        let (scheduler_rng, cycler_rng) = match options.seed {
            Some(seed) => (
                StdRng::seed_from_u64(seed),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
            None => (StdRng::from_entropy(), StdRng::from_entropy()),
        };
        let cycler = PaletteCycler::new(
            Palette::fallback_from(config.palette.fallback_start),
            config.palette.cycle_range(),
            cycler_rng,
        );
        let scheduler = ContentScheduler::new(config, cycler, scheduler_rng);
        let snapshot = Arc::new(Mutex::new(scheduler.snapshot()));

        let (commands, inbox) = mpsc::channel();
        let watcher = match options.watch_config {
            Some(path) => {
                let refresh = commands.clone();
                let watcher = ConfigWatcher::spawn(path, move || {
                    let _ = refresh.send(Command::RefreshConfig);
                })?;
                info!(path = %watcher.path().display(), "watching config file");
                Some(watcher)
            }
            None => None,
        };

        let engine = {
            let commands = commands.clone();
            let snapshot = Arc::clone(&snapshot);
            thread::Builder::new()
                .name("showcase-engine".into())
                .spawn(move || {
                    Engine {
                        scheduler,
                        collaborators,
                        commands,
                        snapshot,
                        subscribers: Vec::new(),
                    }
                    .run(inbox)
                })?
        };

        Ok(Self {
            commands,
            snapshot,
            engine: Some(engine),
            _watcher: watcher,
        })
    }

    pub fn start(&self) {
        self.send(Command::Start);
    }

    pub fn simulate_now_playing(&self, item: NowPlayingItem) {
        self.send(Command::Simulate(item));
    }

    pub fn refresh_config(&self) {
        self.send(Command::RefreshConfig);
    }

    pub fn subscribe(&self) -> Receiver<StateChange> {
        let (tx, rx) = mpsc::channel();
        self.send(Command::Subscribe(tx));
        rx
    }

    pub fn snapshot(&self) -> ShowcaseSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn shutdown(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        self.send(Command::Shutdown);
        if engine.join().is_err() {
            warn!("showcase engine panicked");
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("showcase engine is gone; command dropped");
        }
    }
}

impl Drop for Showcase {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Engine {
    scheduler: ContentScheduler,
    collaborators: Collaborators,
    commands: Sender<Command>,
    snapshot: Arc<Mutex<ShowcaseSnapshot>>,
    subscribers: Vec<Sender<StateChange>>,
}

impl Engine {
    fn run(mut self, inbox: Receiver<Command>) {
        loop {
            let command = match self.scheduler.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match inbox.recv_timeout(wait) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match inbox.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            let now = Instant::now();
            match command {
                Some(Command::Start) => self.scheduler.start(now),
                Some(Command::Simulate(item)) => self.scheduler.simulate_now_playing(item),
                Some(Command::RefreshConfig) => self.dispatch(FetchRequest::RefreshConfig),
                Some(Command::Subscribe(tx)) => self.subscribers.push(tx),
                Some(Command::Completed(result)) => self.scheduler.handle(result, now),
                Some(Command::Shutdown) => break,
                None => {}
            }

            self.scheduler.advance(now);
            for request in self.scheduler.drain_requests() {
                self.dispatch(request);
            }
            self.publish();
        }
        debug!("showcase engine stopped");
    }

    fn publish(&mut self) {
        *self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = self.scheduler.snapshot();
        for change in self.scheduler.drain_changes() {
            self.subscribers
                .retain(|subscriber| subscriber.send(change.clone()).is_ok());
        }
    }

    fn dispatch(&self, request: FetchRequest) {
        debug!(?request, "dispatching fetch");
        let collaborators = self.collaborators.clone();
        let clusterer = ColorClusterer::new(self.scheduler.config().palette.fallback_start);
        let fallback = request.empty_result();
        let results = self.commands.clone();
        let spawned = thread::Builder::new()
            .name("showcase-fetch".into())
            .spawn(move || {
                let result = run_fetch(request, &collaborators, &clusterer);
                let _ = results.send(Command::Completed(result));
            });
        if let Err(err) = spawned {
            warn!("Failed to spawn fetch worker: {err}");
            let _ = self.commands.send(Command::Completed(fallback));
        }
    }
}

fn run_fetch(
    request: FetchRequest,
    collaborators: &Collaborators,
    clusterer: &ColorClusterer,
) -> FetchResult {
    match request {
        FetchRequest::RefreshConfig => {
            let config = settle("config", block_on(collaborators.config.fetch()));
            FetchResult::Config(or_log(config, None))
        }
        FetchRequest::RequestAccess => {
            let access = settle(
                "now-playing access",
                block_on(collaborators.now_playing.request_access_if_needed()),
            );
            FetchResult::Access {
                granted: or_log(access.map(|_| true), false),
            }
        }
        FetchRequest::RefreshNowPlaying { epoch } => {
            let item = settle(
                "now playing",
                block_on(collaborators.now_playing.current_item()),
            );
            FetchResult::NowPlaying {
                epoch,
                item: or_log(item, None),
            }
        }
        FetchRequest::Facts {
            epoch,
            purpose,
            query,
        } => {
            let facts = settle("facts", block_on(collaborators.facts.fetch_facts(query)));
            FetchResult::Facts {
                epoch,
                purpose,
                facts: or_log(facts, Vec::new()),
            }
        }
        FetchRequest::Note => FetchResult::Note(block_on(collaborators.editorial.current_note())),
        FetchRequest::Artwork {
            key,
            query,
            max_candidates,
        } => FetchResult::Artwork(load_artwork(
            key,
            query,
            max_candidates,
            collaborators,
            clusterer,
        )),
    }
}

fn load_artwork(
    key: String,
    query: ArtworkQuery,
    max_candidates: usize,
    collaborators: &Collaborators,
    clusterer: &ColorClusterer,
) -> ArtworkBundle {
    let primary = settle(
        "primary artwork",
        block_on(collaborators.artwork.fetch_primary(query.clone())),
    );
    let primary = or_log(primary, None);
    let extra = settle(
        "artwork candidates",
        block_on(collaborators.artwork.fetch_candidates(query, max_candidates)),
    );
    let extra = or_log(extra, Vec::new());

    let mut seen = HashSet::new();
    let mut candidates: Vec<Arc<RgbaImage>> = Vec::new();
    for bytes in primary.iter().chain(extra.iter()) {
        if candidates.len() >= max_candidates {
            break;
        }
        if !seen.insert(hash_bytes(bytes)) {
            continue;
        }
        if let Some(image) = decode_logged(bytes) {
            candidates.push(Arc::new(image));
        }
    }

    let palettes = (!candidates.is_empty())
        .then(|| clusterer.extract_many(candidates.iter().map(|image| &**image)));
    debug!(
        %key,
        candidates = candidates.len(),
        palettes = palettes.as_ref().map_or(0, Vec::len),
        "artwork loaded"
    );

    ArtworkBundle {
        key,
        candidates,
        palettes,
    }
}

fn decode_logged(bytes: &[u8]) -> Option<RgbaImage> {
    match decode_artwork(bytes) {
        Ok(image) => Some(image),
        Err(err) => {
            warn!("{err}");
            None
        }
    }
}

fn settle<T>(what: &str, result: anyhow::Result<T>) -> ShowcaseResult<T> {
    result.map_err(|err| ShowcaseError::fetch(format!("{what}: {err:#}")))
}

fn or_log<T>(result: ShowcaseResult<T>, fallback: T) -> T {
    result.unwrap_or_else(|err| {
        warn!("{err}");
        fallback
    })
}

fn hash_bytes(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}
