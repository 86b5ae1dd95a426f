//! State shared between the producer side and the compositor

pub mod window_registry;

pub use window_registry::{find_window, WindowRegistry};
