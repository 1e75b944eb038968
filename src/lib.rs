pub mod color;
pub mod config;
pub mod cycler;
pub mod deferred;
pub mod engine;
pub mod error;
pub mod lane;
pub mod model;
pub mod palette;
pub mod scheduler;
pub mod sources;

pub use config::Config;
pub use engine::{EngineOptions, Showcase};
pub use error::{ShowcaseError, ShowcaseResult};
pub use model::{EditorialNote, Fact, FactSubject, NowPlayingItem};
pub use palette::{ColorClusterer, Palette};
pub use scheduler::{ContentScheduler, ShowcaseSnapshot, StateChange};
pub use sources::Collaborators;
