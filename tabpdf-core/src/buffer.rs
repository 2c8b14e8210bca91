use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::RenderImage;

#[derive(Debug, Default)]
struct Counters {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

/// Shared accounting for every page buffer the pipeline hands out.
#[derive(Debug, Clone, Default)]
pub struct BufferLedger {
    counters: Arc<Counters>,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(&self, image: RenderImage) -> PageBuffer {
        self.counters.allocated.fetch_add(1, Ordering::AcqRel);
        PageBuffer {
            image,
            ledger: self.clone(),
        }
    }

    pub fn allocated(&self) -> usize {
        self.counters.allocated.load(Ordering::Acquire)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::Acquire)
    }

    pub fn live(&self) -> usize {
        self.allocated().saturating_sub(self.released())
    }
}

/// A rendered page. Dropping it releases the buffer in the ledger.
pub struct PageBuffer {
    image: RenderImage,
    ledger: BufferLedger,
}

impl PageBuffer {
    pub fn image(&self) -> &RenderImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuffer")
            .field("width", &self.image.width)
            .field("height", &self.image.height)
            .finish()
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        self.ledger.counters.released.fetch_add(1, Ordering::AcqRel);
    }
}
