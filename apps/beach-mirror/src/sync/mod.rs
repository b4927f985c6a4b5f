//! Caches of live app state, replayed to clients that join late.

pub mod actor;
pub mod animation;
pub mod asset;
pub mod media;

pub use actor::{ActorArena, ArenaError, SyncActor};
pub use animation::{AnimationCache, SyncAnimation};
pub use asset::{AssetCache, AssetCreator, SyncAsset};
pub use media::{apply_media_command, ActiveMediaInstance};
