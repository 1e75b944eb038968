use anyhow::{anyhow, Result};
use rand::{seq::SliceRandom, Rng};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneAlign {
    Start,
    Center,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayLane {
    TopLeft,
    TopRight,
    BottomRight,
    BottomCenter,
}

impl OverlayLane {
    pub const ALL: [OverlayLane; 4] = [
        OverlayLane::TopLeft,
        OverlayLane::TopRight,
        OverlayLane::BottomRight,
        OverlayLane::BottomCenter,
    ];

    pub const TOP: [OverlayLane; 2] = [OverlayLane::TopLeft, OverlayLane::TopRight];

    pub fn is_top(self) -> bool {
        OverlayLane::TOP.contains(&self)
    }

    pub fn anchor(self) -> (LaneAlign, LaneAlign) {
        match self {
            OverlayLane::TopLeft => (LaneAlign::Start, LaneAlign::Start),
            OverlayLane::TopRight => (LaneAlign::End, LaneAlign::Start),
            OverlayLane::BottomRight => (LaneAlign::End, LaneAlign::End),
            OverlayLane::BottomCenter => (LaneAlign::Center, LaneAlign::End),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OverlayLane::TopLeft => "top_left",
            OverlayLane::TopRight => "top_right",
            OverlayLane::BottomRight => "bottom_right",
            OverlayLane::BottomCenter => "bottom_center",
        }
    }
}

impl fmt::Display for OverlayLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayLane {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        OverlayLane::ALL
            .into_iter()
            .find(|lane| lane.as_str() == normalized)
            .ok_or_else(|| anyhow!("Unknown overlay lane: {value}"))
    }
}

/// Facts alternate between the two top lanes; the first one is picked at random.
pub fn next_fact_lane<R: Rng>(previous: Option<OverlayLane>, rng: &mut R) -> OverlayLane {
    match previous {
        Some(OverlayLane::TopLeft) => OverlayLane::TopRight,
        Some(OverlayLane::TopRight) => OverlayLane::TopLeft,
        _ => OverlayLane::TOP[rng.gen_range(0..OverlayLane::TOP.len())],
    }
}

pub fn next_note_lane<R: Rng>(previous: Option<OverlayLane>, rng: &mut R) -> OverlayLane {
    let choices: Vec<OverlayLane> = OverlayLane::ALL
        .into_iter()
        .filter(|lane| Some(*lane) != previous)
        .collect();
    choices
        .choose(rng)
        .copied()
        .unwrap_or(OverlayLane::BottomCenter)
}
