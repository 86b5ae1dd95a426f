//! Pipeline state guard
//!
//! Brackets the overlay draw: the host's bindings are captured when the guard
//! is created and re-installed when it is dropped, on every exit path
//! including unwinding.

use std::ops::{Deref, DerefMut};
use tracing::warn;

use super::backend::{OverlayPipelineDesc, PipelineContext};

pub struct PipelineStateGuard<'a, C: PipelineContext> {
    context: &'a mut C,
    saved: Option<C::Snapshot>,
    prepared: bool,
}

impl<'a, C: PipelineContext> PipelineStateGuard<'a, C> {
    /// Capture the host state, then install the overlay state
    pub fn new(context: &'a mut C, overlay: &OverlayPipelineDesc) -> Self {
        let saved = context.save_state();
        let prepared = match context.install_overlay_state(overlay) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to install overlay pipeline state: {}", e);
                false
            }
        };
        Self {
            context,
            saved: Some(saved),
            prepared,
        }
    }

    /// Whether the overlay state is in place; drawing without it would use
    /// the host's bindings
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Restore the host state now
    pub fn restore(self) {}
}

impl<C: PipelineContext> Deref for PipelineStateGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.context
    }
}

impl<C: PipelineContext> DerefMut for PipelineStateGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.context
    }
}

impl<C: PipelineContext> Drop for PipelineStateGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.context.restore_state(saved);
        }
    }
}
