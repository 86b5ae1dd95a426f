//! Overlay - window sprite compositor
//!
//! Composites externally rendered overlay windows on top of a host
//! application's frames. Producers describe windows through a
//! [`WindowRegistry`]; the compositor keeps one GPU sprite per window in sync
//! with it and draws the sprites inside a state-preserving pipeline bracket.

pub mod compositor;
pub mod config;
pub mod logging;
pub mod shared;
pub mod shm;

pub use compositor::sync::{sync_channel, SyncMailbox, SyncSender};
pub use compositor::{FrameSummary, SpriteCompositor};
pub use config::OverlayConfig;
pub use shared::WindowRegistry;
pub use shm::{BindError, SharedMemoryOpener};

pub use overlay_proto::{FrameBufferHeader, Rect, SyncEvent, WindowId, WindowInfo};
