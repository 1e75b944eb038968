use image::RgbaImage;
use rand::{rngs::StdRng, Rng};
use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::{
    config::Config,
    cycler::PaletteCycler,
    deferred::DeferredTasks,
    lane::{next_fact_lane, next_note_lane, OverlayLane},
    model::{EditorialNote, Fact, NowPlayingItem},
    palette::Palette,
    sources::{ArtworkQuery, FactQuery},
};

pub const INSERTION_SECS: f64 = 0.6;
pub const FACT_BUFFER_SECS: f64 = 0.3;
pub const FACT_DWELL_SECS: (f64, f64) = (3.0, 5.0);
pub const INTERSTITIAL_DWELL_SECS: (f64, f64) = (2.5, 3.5);
pub const SEPARATION: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    FactTick,
    NoteTick,
    FactHide,
    NoteHide,
    InterstitialHide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactPurpose {
    Prefetch,
    TopUp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchRequest {
    RefreshConfig,
    RequestAccess,
    RefreshNowPlaying {
        epoch: u64,
    },
    Facts {
        epoch: u64,
        purpose: FactPurpose,
        query: FactQuery,
    },
    Note,
    Artwork {
        key: String,
        query: ArtworkQuery,
        max_candidates: usize,
    },
}

impl FetchRequest {
    /// The result delivered when the request could not be carried out at all.
    pub fn empty_result(&self) -> FetchResult {
        match self {
            FetchRequest::RefreshConfig => FetchResult::Config(None),
            FetchRequest::RequestAccess => FetchResult::Access { granted: false },
            FetchRequest::RefreshNowPlaying { epoch } => FetchResult::NowPlaying {
                epoch: *epoch,
                item: None,
            },
            FetchRequest::Facts { epoch, purpose, .. } => FetchResult::Facts {
                epoch: *epoch,
                purpose: *purpose,
                facts: Vec::new(),
            },
            FetchRequest::Note => FetchResult::Note(None),
            FetchRequest::Artwork { key, .. } => FetchResult::Artwork(ArtworkBundle {
                key: key.clone(),
                ..ArtworkBundle::default()
            }),
        }
    }
}

/// Artwork bundle for one `artist|album` key.
#[derive(Clone, Default)]
pub struct ArtworkBundle {
    pub key: String,
    pub candidates: Vec<Arc<RgbaImage>>,
    pub palettes: Option<Vec<Palette>>,
}

impl fmt::Debug for ArtworkBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtworkBundle")
            .field("key", &self.key)
            .field("candidates", &self.candidates.len())
            .field("palettes", &self.palettes.as_ref().map(Vec::len))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum FetchResult {
    Config(Option<Config>),
    Access { granted: bool },
    NowPlaying {
        epoch: u64,
        item: Option<NowPlayingItem>,
    },
    Facts {
        epoch: u64,
        purpose: FactPurpose,
        facts: Vec<Fact>,
    },
    Note(Option<EditorialNote>),
    Artwork(ArtworkBundle),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShownFact {
    pub fact: Fact,
    pub lane: OverlayLane,
    pub shown_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShownNote {
    pub note: EditorialNote,
    pub lane: OverlayLane,
    pub shown_at: Instant,
}

#[derive(Clone)]
pub struct Interstitial {
    pub index: usize,
    pub image: Arc<RgbaImage>,
    pub shown_at: Instant,
}

impl fmt::Debug for Interstitial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interstitial")
            .field("index", &self.index)
            .field("size", &self.image.dimensions())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum StateChange {
    TrackChanged(NowPlayingItem),
    FactShown { fact: Fact, lane: OverlayLane },
    FactHidden,
    NoteShown { note: EditorialNote, lane: OverlayLane },
    NoteHidden,
    InterstitialShown { index: usize },
    InterstitialHidden,
    PaletteChanged { palette: Palette, count: usize },
    ArtworkUpdated { candidates: usize },
}

#[derive(Debug, Clone)]
pub struct ShowcaseSnapshot {
    pub track: NowPlayingItem,
    pub fact: Option<ShownFact>,
    pub note: Option<ShownNote>,
    pub interstitial: Option<Interstitial>,
    pub palette: Palette,
    pub palette_count: usize,
    pub queued_facts: usize,
}

#[derive(Debug, Default)]
pub struct FactQueue {
    items: VecDeque<Fact>,
}

impl FactQueue {
    pub fn extend(&mut self, facts: impl IntoIterator<Item = Fact>) {
        self.items.extend(facts);
    }

    pub fn pop(&mut self) -> Option<Fact> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Default)]
struct ArtworkPool {
    key: Option<String>,
    candidates: Vec<Arc<RgbaImage>>,
    next_index: usize,
}

pub struct ContentScheduler {
    config: Config,
    rng: StdRng,
    palettes: PaletteCycler,
    timers: DeferredTasks<TimerKey>,
    started: bool,
    access_requested: bool,

    track: NowPlayingItem,
    epoch: u64,
    queue: FactQueue,
    facts_in_flight: bool,
    note_in_flight: bool,

    current_fact: Option<ShownFact>,
    current_note: Option<ShownNote>,
    interstitial: Option<Interstitial>,
    last_fact_lane: Option<OverlayLane>,
    last_note_lane: Option<OverlayLane>,
    last_fact_shown_at: Option<Instant>,
    last_note_shown_at: Option<Instant>,

    artwork: ArtworkPool,
    facts_since_rotation: u32,
    rotation_threshold: u32,

    requests: Vec<FetchRequest>,
    changes: Vec<StateChange>,
}

impl ContentScheduler {
    pub fn new(config: Config, palettes: PaletteCycler, rng: StdRng) -> Self {
        let track = config.now_playing.clone();
        let mut scheduler = Self {
            config,
            rng,
            palettes,
            timers: DeferredTasks::new(),
            started: false,
            access_requested: false,
            track,
            epoch: 0,
            queue: FactQueue::default(),
            facts_in_flight: false,
            note_in_flight: false,
            current_fact: None,
            current_note: None,
            interstitial: None,
            last_fact_lane: None,
            last_note_lane: None,
            last_fact_shown_at: None,
            last_note_shown_at: None,
            artwork: ArtworkPool::default(),
            facts_since_rotation: 0,
            rotation_threshold: 0,
            requests: Vec::new(),
            changes: Vec::new(),
        };
        scheduler.palettes.set_cycle_range(scheduler.config.palette.cycle_range());
        scheduler.rotation_threshold = scheduler.draw_rotation_threshold();
        scheduler
    }

    pub fn start(&mut self, now: Instant) {
        if self.started {
            debug!("scheduler already started");
            return;
        }
        self.started = true;
        info!(track = %self.track, "starting showcase scheduler");

        self.requests.push(FetchRequest::RefreshConfig);
        if !self.access_requested {
            self.access_requested = true;
            self.requests.push(FetchRequest::RequestAccess);
        }
        self.requests
            .push(FetchRequest::RefreshNowPlaying { epoch: self.epoch });
        self.prefetch_facts();
        self.request_artwork(false);

        self.changes.push(StateChange::TrackChanged(self.track.clone()));
        self.publish_palette();

        self.timers.schedule(TimerKey::FactTick, now);
        if self.config.notes.enabled {
            self.arm_note_tick(now);
        }
    }

    pub fn simulate_now_playing(&mut self, item: NowPlayingItem) {
        info!(track = %item, "simulated now playing");
        self.change_track(item, true);
    }

    pub fn apply_config(&mut self, config: Config, now: Instant) {
        let notes_were_enabled = self.config.notes.enabled;
        self.config = config;
        self.palettes.set_cycle_range(self.config.palette.cycle_range());

        if !self.started {
            return;
        }
        match (notes_were_enabled, self.config.notes.enabled) {
            (false, true) => {
                debug!("editorial notes enabled");
                self.arm_note_tick(now);
            }
            (true, false) => {
                debug!("editorial notes disabled");
                self.timers.cancel(TimerKey::NoteTick);
                self.hide_note();
            }
            _ => {}
        }
    }

    pub fn handle(&mut self, result: FetchResult, now: Instant) {
        match result {
            FetchResult::Config(Some(config)) => {
                debug!("remote config refreshed");
                self.apply_config(config, now);
            }
            FetchResult::Config(None) => debug!("config refresh produced nothing; keeping values"),
            FetchResult::Access { granted } => {
                if !granted {
                    info!("now-playing access not granted; continuing without it");
                }
            }
            FetchResult::NowPlaying { epoch, .. } if epoch != self.epoch => {
                debug!(epoch, current = self.epoch, "dropping now-playing for replaced track");
            }
            FetchResult::NowPlaying {
                item: Some(item), ..
            } => self.change_track(item, false),
            FetchResult::NowPlaying { item: None, .. } => {
                debug!("nothing reported as now playing")
            }
            FetchResult::Facts {
                epoch,
                purpose,
                facts,
            } => self.receive_facts(epoch, purpose, facts),
            FetchResult::Note(note) => self.receive_note(note, now),
            FetchResult::Artwork(bundle) => self.receive_artwork(bundle, now),
        }
    }

    /// Asks for artwork of the current track. Unless `force` is set, a request
    /// for the key already fetched is dropped. Returns whether one was queued.
    pub fn request_artwork(&mut self, force: bool) -> bool {
        let key = self.track.artwork_key();
        if !force && self.artwork.key.as_deref() == Some(key.as_str()) {
            debug!(%key, "artwork already requested for key");
            return false;
        }
        self.artwork.key = Some(key.clone());
        self.requests.push(FetchRequest::Artwork {
            key,
            query: ArtworkQuery::for_item(&self.track),
            max_candidates: self.config.artwork.max_candidates(),
        });
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.timers.next_due(), self.palettes.next_due()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn advance(&mut self, now: Instant) {
        while let Some(due) = self.next_deadline() {
            if due > now {
                break;
            }
            if self.palettes.next_due() == Some(due) {
                let Some(palette) = self.palettes.poll(due) else {
                    break;
                };
                self.changes.push(StateChange::PaletteChanged {
                    palette,
                    count: self.palettes.len(),
                });
                continue;
            }
            match self.timers.pop_due(due) {
                Some(key) => self.fire(key, due),
                None => break,
            }
        }
    }

    pub fn drain_requests(&mut self) -> Vec<FetchRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn drain_changes(&mut self) -> Vec<StateChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn snapshot(&self) -> ShowcaseSnapshot {
        ShowcaseSnapshot {
            track: self.track.clone(),
            fact: self.current_fact.clone(),
            note: self.current_note.clone(),
            interstitial: self.interstitial.clone(),
            palette: self.palettes.current(),
            palette_count: self.palettes.len(),
            queued_facts: self.queue.len(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn track(&self) -> &NowPlayingItem {
        &self.track
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn current_fact(&self) -> Option<&ShownFact> {
        self.current_fact.as_ref()
    }

    pub fn current_note(&self) -> Option<&ShownNote> {
        self.current_note.as_ref()
    }

    pub fn interstitial(&self) -> Option<&Interstitial> {
        self.interstitial.as_ref()
    }

    pub fn queued_facts(&self) -> usize {
        self.queue.len()
    }

    pub fn palette_count(&self) -> usize {
        self.palettes.len()
    }

    pub fn rotation_threshold(&self) -> u32 {
        self.rotation_threshold
    }

    pub fn pending_timers(&self) -> Vec<TimerKey> {
        let mut keys: Vec<TimerKey> = self.timers.keys().collect();
        keys.sort();
        keys
    }

    pub fn timer_due(&self, key: TimerKey) -> Option<Instant> {
        self.timers.due_at(key)
    }

    fn fire(&mut self, key: TimerKey, now: Instant) {
        match key {
            TimerKey::FactTick => self.on_fact_tick(now),
            TimerKey::NoteTick => self.on_note_tick(now),
            TimerKey::FactHide => {
                if self.current_fact.take().is_some() {
                    self.changes.push(StateChange::FactHidden);
                }
            }
            TimerKey::NoteHide => self.hide_note(),
            TimerKey::InterstitialHide => {
                if self.interstitial.take().is_some() {
                    self.changes.push(StateChange::InterstitialHidden);
                }
            }
        }
    }

    fn on_fact_tick(&mut self, now: Instant) {
        let dwell = self
            .rng
            .gen_range(FACT_DWELL_SECS.0..=FACT_DWELL_SECS.1);

        if self.should_show_interstitial(now) {
            self.show_interstitial(now);
        } else if within_separation(self.last_note_shown_at, now) {
            debug!("fact tick skipped: note shown recently");
        } else if let Some(fact) = self.queue.pop() {
            self.show_fact(fact, dwell, now);
            self.count_toward_rotation();
        } else {
            debug!("fact tick with empty queue");
        }
        self.top_up_if_needed();

        let interval = INSERTION_SECS + dwell + FACT_BUFFER_SECS;
        self.timers
            .schedule(TimerKey::FactTick, now + Duration::from_secs_f64(interval));
    }

    fn show_fact(&mut self, fact: Fact, dwell: f64, now: Instant) {
        self.timers.cancel(TimerKey::FactHide);
        let lane = next_fact_lane(self.last_fact_lane, &mut self.rng);
        debug!(%lane, text = %fact.text, "showing fact");

        self.last_fact_lane = Some(lane);
        self.last_fact_shown_at = Some(now);
        self.current_fact = Some(ShownFact {
            fact: fact.clone(),
            lane,
            shown_at: now,
        });
        self.changes.push(StateChange::FactShown { fact, lane });
        self.timers.schedule(
            TimerKey::FactHide,
            now + Duration::from_secs_f64(dwell + INSERTION_SECS),
        );
    }

    fn top_up_if_needed(&mut self) {
        if self.queue.len() > self.config.facts.prefetch_threshold() || self.facts_in_flight {
            return;
        }
        self.request_facts(FactPurpose::TopUp, self.config.facts.top_up_batch());
    }

    fn prefetch_facts(&mut self) {
        self.request_facts(FactPurpose::Prefetch, self.config.facts.initial_batch());
    }

    fn request_facts(&mut self, purpose: FactPurpose, max: usize) {
        self.facts_in_flight = true;
        self.requests.push(FetchRequest::Facts {
            epoch: self.epoch,
            purpose,
            query: FactQuery {
                artist: self.track.artist.clone(),
                album: self.track.album.clone(),
                year: self.track.release_year,
                max,
            },
        });
    }

    fn receive_facts(&mut self, epoch: u64, purpose: FactPurpose, facts: Vec<Fact>) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "dropping facts for previous track");
            return;
        }
        self.facts_in_flight = false;
        debug!(?purpose, count = facts.len(), "facts received");
        self.queue.extend(facts);
    }

    fn count_toward_rotation(&mut self) {
        self.facts_since_rotation += 1;
        if self.facts_since_rotation < self.rotation_threshold {
            return;
        }
        debug!(after = self.facts_since_rotation, "rotating artwork");
        self.facts_since_rotation = 0;
        self.request_artwork(true);
        self.rotation_threshold = self.draw_rotation_threshold();
    }

    fn draw_rotation_threshold(&mut self) -> u32 {
        match self.palettes.len() {
            n if n >= 4 => self.rng.gen_range(3..=4),
            2 | 3 => self.rng.gen_range(4..=5),
            _ => self.rng.gen_range(5..=7),
        }
    }

    fn should_show_interstitial(&mut self, now: Instant) -> bool {
        let available = self.artwork.candidates.len();
        if available == 0
            || self.current_fact.is_some()
            || self.interstitial.is_some()
            || within_separation(self.last_note_shown_at, now)
        {
            return false;
        }
        let chance = match available {
            n if n >= 4 => 0.5,
            2 | 3 => 1.0 / 3.0,
            _ => 0.2,
        };
        self.rng.gen_bool(chance)
    }

    fn show_interstitial(&mut self, now: Instant) {
        let count = self.artwork.candidates.len();
        let index = self.artwork.next_index % count;
        self.artwork.next_index = (index + 1) % count;

        let dwell = self
            .rng
            .gen_range(INTERSTITIAL_DWELL_SECS.0..=INTERSTITIAL_DWELL_SECS.1);
        debug!(index, dwell, "showing artwork interstitial");
        self.interstitial = Some(Interstitial {
            index,
            image: Arc::clone(&self.artwork.candidates[index]),
            shown_at: now,
        });
        self.changes.push(StateChange::InterstitialShown { index });
        self.timers.schedule(
            TimerKey::InterstitialHide,
            now + Duration::from_secs_f64(dwell),
        );
    }

    fn hide_interstitial(&mut self) {
        self.timers.cancel(TimerKey::InterstitialHide);
        if self.interstitial.take().is_some() {
            self.changes.push(StateChange::InterstitialHidden);
        }
    }

    fn on_note_tick(&mut self, now: Instant) {
        if !self.config.notes.enabled {
            return;
        }
        if within_separation(self.last_fact_shown_at, now) {
            debug!("note tick skipped: fact shown recently");
        } else if !self.note_in_flight {
            self.note_in_flight = true;
            self.requests.push(FetchRequest::Note);
        }
        self.arm_note_tick(now);
    }

    fn arm_note_tick(&mut self, now: Instant) {
        let (min, max) = self.config.notes.interval_range();
        let secs = if max > min {
            self.rng.gen_range(min..=max)
        } else {
            min
        };
        self.timers
            .schedule(TimerKey::NoteTick, now + Duration::from_secs_f64(secs));
    }

    fn receive_note(&mut self, note: Option<EditorialNote>, now: Instant) {
        self.note_in_flight = false;
        let Some(note) = note else {
            debug!("no editorial note available");
            return;
        };
        if !self.config.notes.enabled {
            return;
        }
        if within_separation(self.last_fact_shown_at, now) {
            debug!("dropping note: fact shown while it was fetched");
            return;
        }

        let lane = next_note_lane(self.last_note_lane, &mut self.rng);
        debug!(%lane, "showing editorial note");
        self.last_note_lane = Some(lane);
        self.last_note_shown_at = Some(now);
        self.current_note = Some(ShownNote {
            note: note.clone(),
            lane,
            shown_at: now,
        });
        self.changes.push(StateChange::NoteShown { note, lane });

        match self.config.notes.dwell() {
            Some(dwell) => {
                self.timers.schedule(TimerKey::NoteHide, now + dwell);
            }
            None => self.timers.cancel(TimerKey::NoteHide),
        }
    }

    fn hide_note(&mut self) {
        self.timers.cancel(TimerKey::NoteHide);
        if self.current_note.take().is_some() {
            self.changes.push(StateChange::NoteHidden);
        }
    }

    fn receive_artwork(&mut self, bundle: ArtworkBundle, now: Instant) {
        if self.artwork.key.as_deref() != Some(bundle.key.as_str()) {
            debug!(key = %bundle.key, "dropping artwork for previous track");
            return;
        }

        if !bundle.candidates.is_empty() {
            self.artwork.candidates = bundle.candidates;
            self.artwork.next_index = 0;
            self.changes.push(StateChange::ArtworkUpdated {
                candidates: self.artwork.candidates.len(),
            });
        }

        if let Some(sequence) = bundle.palettes {
            self.palettes.adopt(sequence, now);
            self.publish_palette();
            self.rotation_threshold = self.draw_rotation_threshold();
        }
    }

    fn publish_palette(&mut self) {
        self.changes.push(StateChange::PaletteChanged {
            palette: self.palettes.current(),
            count: self.palettes.len(),
        });
    }

    fn change_track(&mut self, item: NowPlayingItem, force: bool) {
        if !force && item.artwork_key() == self.track.artwork_key() {
            debug!(track = %item, "now playing unchanged");
            return;
        }

        self.track = item;
        self.epoch += 1;
        self.queue.clear();
        self.facts_in_flight = false;
        self.facts_since_rotation = 0;

        self.timers.cancel(TimerKey::FactHide);
        if self.current_fact.take().is_some() {
            self.changes.push(StateChange::FactHidden);
        }
        self.hide_interstitial();
        self.artwork.candidates.clear();
        self.artwork.next_index = 0;

        self.changes.push(StateChange::TrackChanged(self.track.clone()));
        self.request_artwork(force);
        self.prefetch_facts();
    }
}

fn within_separation(last: Option<Instant>, now: Instant) -> bool {
    last.map_or(false, |at| now.saturating_duration_since(at) < SEPARATION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{color::Rgb, model::FactSubject};
    use rand::SeedableRng;

    fn secs(value: f64) -> Duration {
        Duration::from_secs_f64(value)
    }

    fn config(notes: bool) -> Config {
        let mut config = Config::default();
        config.notes.enabled = notes;
        config
    }

    fn scheduler_with(config: Config, seed: u64) -> ContentScheduler {
        let cycler = PaletteCycler::new(
            Palette::default(),
            config.palette.cycle_range(),
            StdRng::seed_from_u64(seed ^ 0xFEED),
        );
        ContentScheduler::new(config, cycler, StdRng::seed_from_u64(seed))
    }

    fn facts(texts: &[&str]) -> Vec<Fact> {
        texts
            .iter()
            .map(|t| Fact::new(*t, FactSubject::Artist, None))
            .collect()
    }

    fn many_facts(n: usize) -> Vec<Fact> {
        (0..n)
            .map(|i| Fact::new(format!("fact {i}"), FactSubject::Album, None))
            .collect()
    }

    fn image() -> Arc<RgbaImage> {
        Arc::new(RgbaImage::new(4, 4))
    }

    fn deliver_facts(s: &mut ContentScheduler, list: Vec<Fact>, now: Instant) {
        let epoch = s.epoch();
        s.handle(
            FetchResult::Facts {
                epoch,
                purpose: FactPurpose::Prefetch,
                facts: list,
            },
            now,
        );
    }

    fn shown_facts(changes: &[StateChange]) -> Vec<(String, OverlayLane)> {
        changes
            .iter()
            .filter_map(|c| match c {
                StateChange::FactShown { fact, lane } => Some((fact.text.clone(), *lane)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_is_idempotent() {
        let t0 = Instant::now();
        let mut once = scheduler_with(config(true), 1);
        once.start(t0);

        let mut twice = scheduler_with(config(true), 1);
        twice.start(t0);
        twice.start(t0);

        assert_eq!(once.pending_timers(), twice.pending_timers());
        assert_eq!(
            once.pending_timers(),
            vec![TimerKey::FactTick, TimerKey::NoteTick]
        );
        assert_eq!(once.drain_requests(), twice.drain_requests());
    }

    #[test]
    fn start_requests_startup_fetches() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(true), 2);
        s.start(t0);
        let requests = s.drain_requests();

        assert!(requests.contains(&FetchRequest::RefreshConfig));
        assert!(requests.contains(&FetchRequest::RequestAccess));
        assert!(requests.contains(&FetchRequest::RefreshNowPlaying { epoch: 0 }));
        assert!(requests.iter().any(|r| matches!(
            r,
            FetchRequest::Facts { purpose: FactPurpose::Prefetch, query, .. } if query.max == 10
        )));
        assert!(requests
            .iter()
            .any(|r| matches!(r, FetchRequest::Artwork { .. })));
        assert_eq!(s.timer_due(TimerKey::FactTick), Some(t0));
    }

    #[test]
    fn two_fact_scenario_alternates_and_tops_up() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 3);
        s.start(t0);
        s.drain_requests();
        deliver_facts(&mut s, facts(&["A releases in 1999", "B blends styles"]), t0);

        s.advance(t0);
        let first = s.current_fact().cloned().expect("first fact visible");
        assert_eq!(first.fact.text, "A releases in 1999");
        assert!(first.lane.is_top());

        let hide_at = s.timer_due(TimerKey::FactHide).unwrap();
        let next_tick = s.timer_due(TimerKey::FactTick).unwrap();
        let dwell = hide_at.duration_since(t0).as_secs_f64() - INSERTION_SECS;
        assert!((3.0..=5.0).contains(&dwell));
        let gap = next_tick.duration_since(hide_at).as_secs_f64();
        assert!((gap - FACT_BUFFER_SECS).abs() < 1e-6);

        s.advance(hide_at);
        assert!(s.current_fact().is_none());

        s.advance(next_tick);
        let second = s.current_fact().cloned().expect("second fact visible");
        assert_eq!(second.fact.text, "B blends styles");
        assert!(second.lane.is_top());
        assert_ne!(second.lane, first.lane);
        assert_eq!(s.queued_facts(), 0);

        let requests = s.drain_requests();
        assert!(requests.iter().any(|r| matches!(
            r,
            FetchRequest::Facts { purpose: FactPurpose::TopUp, query, .. } if query.max == 8
        )));
    }

    #[test]
    fn consecutive_fact_lanes_alternate_on_top_row() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 4);
        s.start(t0);
        deliver_facts(&mut s, many_facts(30), t0);
        s.drain_changes();

        s.advance(t0 + secs(120.0));
        let shown = shown_facts(&s.drain_changes());
        assert!(shown.len() >= 20);
        for pair in shown.windows(2) {
            assert!(pair[0].1.is_top() && pair[1].1.is_top());
            assert_ne!(pair[0].1, pair[1].1);
        }
    }

    #[test]
    fn fact_queue_drains_in_order() {
        let mut queue = FactQueue::default();
        let list = facts(&["one", "two", "three"]);
        queue.extend(list.clone());
        for expected in &list {
            assert_eq!(queue.pop().as_ref(), Some(expected));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn fact_waits_for_note_separation() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(true), 5);
        s.start(t0);
        deliver_facts(&mut s, facts(&["held back"]), t0);

        s.handle(FetchResult::Note(Some(EditorialNote::new("blurb"))), t0);
        assert!(s.current_note().is_some());

        s.advance(t0);
        assert!(s.current_fact().is_none());
        assert_eq!(s.queued_facts(), 1);
        let retry = s.timer_due(TimerKey::FactTick).unwrap();
        assert!(retry > t0);

        s.drain_changes();
        s.advance(t0 + secs(12.0));
        assert_eq!(s.queued_facts(), 0);
        assert_eq!(shown_facts(&s.drain_changes()).len(), 1);
        let last = s.last_fact_shown_at.unwrap();
        assert!(last.duration_since(t0) >= SEPARATION);
    }

    #[test]
    fn note_dropped_when_fact_just_shown() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(true), 6);
        s.start(t0);
        deliver_facts(&mut s, facts(&["visible"]), t0);
        s.advance(t0);
        assert!(s.current_fact().is_some());

        s.handle(FetchResult::Note(Some(EditorialNote::new("late"))), t0 + secs(2.0));
        assert!(s.current_note().is_none());
    }

    #[test]
    fn note_tick_skips_inside_separation() {
        let t0 = Instant::now();
        let mut cfg = config(true);
        cfg.notes.min_interval_secs = 2.0;
        cfg.notes.max_interval_secs = 2.0;
        let mut s = scheduler_with(cfg, 7);
        s.start(t0);
        deliver_facts(&mut s, facts(&["x"]), t0);
        s.advance(t0);
        s.drain_requests();

        s.advance(t0 + secs(2.0));
        assert!(!s.drain_requests().contains(&FetchRequest::Note));
        assert_eq!(s.timer_due(TimerKey::NoteTick), Some(t0 + secs(4.0)));
    }

    #[test]
    fn facts_and_notes_never_within_separation() {
        let t0 = Instant::now();
        let mut cfg = config(true);
        cfg.notes.min_interval_secs = 3.0;
        cfg.notes.max_interval_secs = 9.0;
        let mut s = scheduler_with(cfg, 8);
        s.start(t0);
        deliver_facts(&mut s, many_facts(6), t0);

        let mut fact_times = Vec::new();
        let mut note_times = Vec::new();
        let mut now = t0;
        let end = t0 + secs(300.0);
        while now < end {
            now += secs(0.25);
            s.advance(now);
            for request in s.drain_requests() {
                match request {
                    FetchRequest::Note => {
                        s.handle(FetchResult::Note(Some(EditorialNote::new("n"))), now)
                    }
                    FetchRequest::Facts { epoch, purpose, .. } => {
                        // supply dries up for a while so notes get a window
                        let dry = (20.0..90.0).contains(&now.duration_since(t0).as_secs_f64());
                        let facts = if dry { Vec::new() } else { many_facts(2) };
                        s.handle(FetchResult::Facts { epoch, purpose, facts }, now)
                    }
                    _ => {}
                }
            }
            for change in s.drain_changes() {
                match change {
                    StateChange::FactShown { .. } => fact_times.push(now),
                    StateChange::NoteShown { .. } => note_times.push(now),
                    _ => {}
                }
            }
        }

        assert!(!fact_times.is_empty());
        assert!(!note_times.is_empty());
        for f in &fact_times {
            for n in &note_times {
                let gap = if f > n { *f - *n } else { *n - *f };
                assert!(gap >= SEPARATION - secs(0.25), "gap {gap:?}");
            }
        }
    }

    #[test]
    fn same_key_artwork_request_is_noop() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 9);
        s.start(t0);
        s.drain_requests();

        assert!(!s.request_artwork(false));
        assert!(s.drain_requests().is_empty());
        assert!(s.request_artwork(true));
        assert_eq!(s.drain_requests().len(), 1);
    }

    #[test]
    fn repeated_now_playing_for_same_item_is_noop() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 10);
        s.start(t0);
        s.drain_requests();

        let same = Config::default().now_playing;
        s.handle(
            FetchResult::NowPlaying {
                epoch: 0,
                item: Some(same),
            },
            t0,
        );
        assert!(s.drain_requests().is_empty());
        assert_eq!(s.epoch(), 0);
    }

    #[test]
    fn simulated_track_resets_queue_and_refetches() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 11);
        s.start(t0);
        deliver_facts(&mut s, many_facts(5), t0);
        s.advance(t0);
        assert!(s.current_fact().is_some());
        s.drain_requests();
        let old_epoch = s.epoch();

        let item = NowPlayingItem::new("Teardrop", "Massive Attack", "Mezzanine", Some(1998));
        s.simulate_now_playing(item.clone());

        assert_eq!(s.track(), &item);
        assert!(s.current_fact().is_none());
        assert_eq!(s.queued_facts(), 0);
        assert!(!s.pending_timers().contains(&TimerKey::FactHide));

        let requests = s.drain_requests();
        assert!(requests.iter().any(|r| matches!(
            r,
            FetchRequest::Artwork { key, .. } if key == "massive attack|mezzanine"
        )));
        assert!(requests.iter().any(|r| matches!(
            r,
            FetchRequest::Facts { epoch, purpose: FactPurpose::Prefetch, query }
                if *epoch == old_epoch + 1 && query.album == "Mezzanine"
        )));

        s.handle(
            FetchResult::Facts {
                epoch: old_epoch,
                purpose: FactPurpose::TopUp,
                facts: many_facts(3),
            },
            t0 + secs(1.5),
        );
        assert_eq!(s.queued_facts(), 0);
    }

    #[test]
    fn simulating_same_track_still_refetches_artwork() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 12);
        s.start(t0);
        s.drain_requests();

        s.simulate_now_playing(Config::default().now_playing);
        assert!(s
            .drain_requests()
            .iter()
            .any(|r| matches!(r, FetchRequest::Artwork { .. })));
    }

    #[test]
    fn artwork_bundle_updates_palette_and_ignores_stale_keys() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 13);
        s.start(t0);
        s.drain_changes();

        let palettes = vec![
            Palette::from_color(Rgb::new(0.9, 0.1, 0.1)),
            Palette::from_color(Rgb::new(0.1, 0.1, 0.9)),
            Palette::from_color(Rgb::new(0.1, 0.9, 0.1)),
        ];
        s.handle(
            FetchResult::Artwork(ArtworkBundle {
                key: "someone|else".into(),
                candidates: vec![image()],
                palettes: Some(palettes.clone()),
            }),
            t0,
        );
        assert_eq!(s.palette_count(), 1);

        let key = s.track().artwork_key();
        s.handle(
            FetchResult::Artwork(ArtworkBundle {
                key,
                candidates: vec![image(), image()],
                palettes: Some(palettes.clone()),
            }),
            t0,
        );
        assert_eq!(s.palette_count(), 3);
        assert_eq!(s.snapshot().palette, palettes[0]);
        assert!((4..=5).contains(&s.rotation_threshold()));
        let changes = s.drain_changes();
        assert!(changes
            .iter()
            .any(|c| matches!(c, StateChange::ArtworkUpdated { candidates: 2 })));

        s.advance(t0 + secs(21.0));
        assert_eq!(s.snapshot().palette, palettes[1]);
    }

    #[test]
    fn undecodable_artwork_keeps_palette() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 14);
        s.start(t0);
        let before = s.snapshot().palette;
        let key = s.track().artwork_key();
        s.handle(
            FetchResult::Artwork(ArtworkBundle {
                key,
                candidates: Vec::new(),
                palettes: None,
            }),
            t0,
        );
        assert_eq!(s.snapshot().palette, before);
    }

    #[test]
    fn interstitials_rotate_and_hide() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 15);
        s.start(t0);
        let key = s.track().artwork_key();
        s.handle(
            FetchResult::Artwork(ArtworkBundle {
                key,
                candidates: vec![image(), image(), image(), image()],
                palettes: None,
            }),
            t0,
        );
        s.drain_changes();

        let mut now = t0;
        let mut indices = Vec::new();
        while now < t0 + secs(200.0) {
            now += secs(0.1);
            s.advance(now);
            if let Some(shown) = s.interstitial() {
                let visible = now.duration_since(shown.shown_at).as_secs_f64();
                assert!(visible <= INTERSTITIAL_DWELL_SECS.1 + 0.1);
            }
            for change in s.drain_changes() {
                if let StateChange::InterstitialShown { index } = change {
                    indices.push(index);
                }
            }
        }

        assert!(indices.len() >= 5);
        for (n, index) in indices.iter().enumerate() {
            assert_eq!(*index, n % 4);
        }
    }

    #[test]
    fn interstitial_not_shown_over_visible_fact() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 16);
        s.start(t0);
        let key = s.track().artwork_key();
        s.handle(
            FetchResult::Artwork(ArtworkBundle {
                key,
                candidates: vec![image(); 4],
                palettes: None,
            }),
            t0,
        );
        deliver_facts(&mut s, many_facts(40), t0);

        let mut now = t0;
        while now < t0 + secs(200.0) {
            now += secs(0.1);
            s.advance(now);
            assert!(!(s.current_fact().is_some() && s.interstitial().is_some()));
        }
    }

    #[test]
    fn artwork_rotates_after_threshold_facts() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 17);
        s.start(t0);
        deliver_facts(&mut s, many_facts(20), t0);
        s.drain_requests();
        let threshold = s.rotation_threshold();
        assert!((5..=7).contains(&threshold));

        let mut shown = 0;
        let mut rotated_after = None;
        let mut now = t0;
        while now < t0 + secs(120.0) && rotated_after.is_none() {
            s.advance(now);
            shown += shown_facts(&s.drain_changes()).len();
            if s
                .drain_requests()
                .iter()
                .any(|r| matches!(r, FetchRequest::Artwork { .. }))
            {
                rotated_after = Some(shown);
            }
            now += secs(0.1);
        }
        assert_eq!(rotated_after, Some(threshold as usize));
    }

    #[test]
    fn disabling_notes_cancels_note_loop() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(true), 18);
        s.start(t0);
        s.handle(FetchResult::Note(Some(EditorialNote::new("n"))), t0);
        assert!(s.pending_timers().contains(&TimerKey::NoteTick));

        s.handle(FetchResult::Config(Some(config(false))), t0);
        assert!(!s.pending_timers().contains(&TimerKey::NoteTick));
        assert!(s.current_note().is_none());

        s.handle(FetchResult::Config(Some(config(true))), t0);
        assert!(s.pending_timers().contains(&TimerKey::NoteTick));
    }

    #[test]
    fn notes_hide_after_dwell_or_persist() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(true), 19);
        s.start(t0);
        s.handle(FetchResult::Note(Some(EditorialNote::new("n"))), t0);
        assert_eq!(s.timer_due(TimerKey::NoteHide), Some(t0 + secs(10.0)));
        s.advance(t0 + secs(10.0));
        assert!(s.current_note().is_none());

        let mut cfg = config(true);
        cfg.notes.dwell_secs = 0.0;
        let mut s = scheduler_with(cfg, 19);
        s.start(t0);
        s.handle(FetchResult::Note(Some(EditorialNote::new("n"))), t0);
        assert_eq!(s.timer_due(TimerKey::NoteHide), None);
        s.advance(t0 + secs(30.0));
        assert!(s.current_note().is_some());
    }

    #[test]
    fn consecutive_notes_change_lane() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(true), 20);
        s.start(t0);
        let mut previous = None;
        for i in 0..10 {
            s.handle(
                FetchResult::Note(Some(EditorialNote::new(format!("n{i}")))),
                t0 + secs(i as f64),
            );
            let lane = s.current_note().map(|n| n.lane);
            assert!(lane.is_some());
            assert_ne!(lane, previous);
            previous = lane;
        }
    }

    #[test]
    fn absent_note_keeps_current() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(true), 21);
        s.start(t0);
        s.handle(FetchResult::Note(Some(EditorialNote::new("kept"))), t0);
        s.handle(FetchResult::Note(None), t0 + secs(1.0));
        assert_eq!(s.current_note().map(|n| n.note.text.as_str()), Some("kept"));
    }

    #[test]
    fn failed_fetches_do_not_stop_fact_loop() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 22);
        s.start(t0);
        deliver_facts(&mut s, Vec::new(), t0);

        s.advance(t0 + secs(30.0));
        assert!(s.pending_timers().contains(&TimerKey::FactTick));
        assert!(s
            .drain_requests()
            .iter()
            .any(|r| matches!(r, FetchRequest::Facts { purpose: FactPurpose::TopUp, .. })));
    }

    #[test]
    fn stale_now_playing_does_not_revert_simulated_track() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 23);
        s.start(t0);
        let startup_epoch = s
            .drain_requests()
            .iter()
            .find_map(|r| match r {
                FetchRequest::RefreshNowPlaying { epoch } => Some(*epoch),
                _ => None,
            })
            .expect("startup now-playing refresh");

        let item = NowPlayingItem::new("", "Air", "Moon Safari", Some(1998));
        s.simulate_now_playing(item.clone());
        let epoch = s.epoch();
        s.drain_requests();
        s.drain_changes();

        s.handle(
            FetchResult::NowPlaying {
                epoch: startup_epoch,
                item: Some(Config::default().now_playing),
            },
            t0 + secs(0.5),
        );
        assert_eq!(s.track(), &item);
        assert_eq!(s.epoch(), epoch);
        assert!(s.drain_requests().is_empty());
        assert!(s.drain_changes().is_empty());
    }

    #[test]
    fn natural_now_playing_change_resets_track() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 24);
        s.start(t0);
        deliver_facts(&mut s, many_facts(6), t0);
        s.advance(t0);
        assert!(s.current_fact().is_some());
        s.drain_requests();
        s.drain_changes();

        let item = NowPlayingItem::new("Angel", "Massive Attack", "Mezzanine", Some(1998));
        let epoch = s.epoch();
        s.handle(
            FetchResult::NowPlaying {
                epoch,
                item: Some(item.clone()),
            },
            t0 + secs(1.0),
        );

        assert_eq!(s.track(), &item);
        assert_eq!(s.epoch(), epoch + 1);
        assert_eq!(s.queued_facts(), 0);
        assert!(s.current_fact().is_none());
        assert!(s
            .drain_changes()
            .iter()
            .any(|c| matches!(c, StateChange::TrackChanged(t) if t.album == "Mezzanine")));
        let requests = s.drain_requests();
        assert!(requests.iter().any(|r| matches!(
            r,
            FetchRequest::Artwork { key, .. } if key == "massive attack|mezzanine"
        )));
        assert!(requests.iter().any(|r| matches!(
            r,
            FetchRequest::Facts { epoch: e, purpose: FactPurpose::Prefetch, .. } if *e == epoch + 1
        )));
    }

    #[test]
    fn track_change_hides_interstitial_and_cancels_its_timer() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(false), 25);
        s.start(t0);
        let key = s.track().artwork_key();
        s.handle(
            FetchResult::Artwork(ArtworkBundle {
                key,
                candidates: vec![image(); 4],
                palettes: None,
            }),
            t0,
        );

        let mut now = t0;
        while s.interstitial().is_none() && now < t0 + secs(120.0) {
            now += secs(0.1);
            s.advance(now);
        }
        assert!(s.interstitial().is_some(), "no interstitial within two minutes");
        let hide_due = s
            .timer_due(TimerKey::InterstitialHide)
            .expect("interstitial hide armed");
        s.drain_changes();

        s.simulate_now_playing(NowPlayingItem::new("", "Air", "Moon Safari", None));
        assert!(s.interstitial().is_none());
        assert!(!s.pending_timers().contains(&TimerKey::InterstitialHide));
        let changes = s.drain_changes();
        assert_eq!(
            changes
                .iter()
                .filter(|c| matches!(c, StateChange::InterstitialHidden))
                .count(),
            1
        );

        s.advance(hide_due + secs(0.1));
        assert!(!s
            .drain_changes()
            .iter()
            .any(|c| matches!(c, StateChange::InterstitialHidden)));
    }

    #[test]
    fn empty_results_release_in_flight_fetches() {
        let t0 = Instant::now();
        let mut s = scheduler_with(config(true), 26);
        s.start(t0);
        s.advance(t0);
        let startup = s.drain_requests();
        assert!(!startup
            .iter()
            .any(|r| matches!(r, FetchRequest::Facts { purpose: FactPurpose::TopUp, .. })));

        for request in &startup {
            s.handle(request.empty_result(), t0);
        }
        let tick = s.timer_due(TimerKey::FactTick).expect("fact tick armed");
        s.advance(tick);
        assert!(s
            .drain_requests()
            .iter()
            .any(|r| matches!(r, FetchRequest::Facts { purpose: FactPurpose::TopUp, .. })));

        let note_tick = s.timer_due(TimerKey::NoteTick).expect("note tick armed");
        s.advance(note_tick);
        let note = s
            .drain_requests()
            .into_iter()
            .find(|r| *r == FetchRequest::Note)
            .expect("note requested");
        s.handle(note.empty_result(), note_tick);

        let next_note_tick = s.timer_due(TimerKey::NoteTick).expect("note tick re-armed");
        s.advance(next_note_tick);
        assert!(s.drain_requests().contains(&FetchRequest::Note));
    }
}
