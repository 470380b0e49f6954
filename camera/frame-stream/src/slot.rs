use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;

use robocam::{Frame, SharedFrame};

#[derive(Default)]
struct SlotInner {
    latest: RwLock<Option<SharedFrame>>,
    published: AtomicU64,
}

/// Holds the most recently published frame.
///
/// Clones share the same slot. Publishing replaces the previous frame
/// atomically, so a reader sees either the old or the new frame and never a
/// partial one.
#[derive(Clone, Default)]
pub struct FrameSlot {
    inner: Arc<SlotInner>,
}

impl FrameSlot {
    /// Replace the current frame, returning how many frames have been
    /// published in total.
    pub fn publish(&self, frame: Frame) -> u64 {
        let frame = Arc::new(frame);
        *self.inner.latest.write() = Some(frame);
        self.inner.published.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn latest(&self) -> Option<SharedFrame> {
        self.inner.latest.read().clone()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        *self.inner.latest.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fno: usize) -> Frame {
        Frame::new(image::RgbImage::new(2, 2), fno)
    }

    #[test]
    fn latest_wins() {
        let slot = FrameSlot::default();
        assert!(slot.latest().is_none());
        for i in 0..5 {
            slot.publish(frame(i));
        }
        assert_eq!(slot.latest().unwrap().host_timing.fno, 4);
        assert_eq!(slot.published_count(), 5);
    }

    #[test]
    fn clones_share_state() {
        let slot = FrameSlot::default();
        let reader = slot.clone();
        let handle = std::thread::spawn(move || {
            slot.publish(frame(7));
        });
        handle.join().unwrap();
        assert_eq!(reader.latest().unwrap().host_timing.fno, 7);
    }
}
