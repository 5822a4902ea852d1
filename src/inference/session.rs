//! The unit of mutual exclusion: one model handle plus its busy flag.

use crate::error::Result;
use crate::runtime::ModelHandle;
use std::sync::atomic::{AtomicBool, Ordering};

/// Pairs the loaded [`ModelHandle`] with the flag that marks a generation
/// as attached to it. The conversation context lives inside the handle.
#[derive(Debug)]
pub struct Session {
    handle: ModelHandle,
    busy: AtomicBool,
}

impl Session {
    /// A free session.
    pub fn new(handle: ModelHandle) -> Self {
        Self {
            handle,
            busy: AtomicBool::new(false),
        }
    }

    /// A session created already busy, so the swapping caller keeps it.
    pub(crate) fn reserved(handle: ModelHandle) -> Self {
        Self {
            handle,
            busy: AtomicBool::new(true),
        }
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn model_name(&self) -> &str {
        self.handle.name()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Flip busy from false to true. Returns false if someone else holds it.
    pub(crate) fn try_reserve(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Drop the accumulated conversation.
    pub async fn clear_context(&self) -> Result<()> {
        self.handle.clear_context().await
    }
}
