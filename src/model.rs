use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactSubject {
    Artist,
    Album,
}

impl FactSubject {
    pub fn as_str(self) -> &'static str {
        match self {
            FactSubject::Artist => "artist",
            FactSubject::Album => "album",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    pub id: u64,
    pub text: String,
    pub subject: FactSubject,
    pub source: Option<String>,
}

impl Fact {
    pub fn new(text: impl Into<String>, subject: FactSubject, source: Option<String>) -> Self {
        Self {
            id: next_id(),
            text: text.into(),
            subject,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorialNote {
    pub id: u64,
    pub text: String,
}

impl EditorialNote {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: next_id(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowPlayingItem {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub release_year: Option<i32>,
}

impl NowPlayingItem {
    pub fn new(
        title: impl Into<String>,
        artist: impl Into<String>,
        album: impl Into<String>,
        release_year: Option<i32>,
    ) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: album.into(),
            release_year,
        }
    }

    pub fn artwork_key(&self) -> String {
        artwork_key(&self.artist, &self.album)
    }
}

impl fmt::Display for NowPlayingItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.album)?;
        if let Some(year) = self.release_year {
            write!(f, " ({year})")?;
        }
        Ok(())
    }
}

pub fn artwork_key(artist: &str, album: &str) -> String {
    format!(
        "{}|{}",
        artist.trim().to_lowercase(),
        album.trim().to_lowercase()
    )
}
