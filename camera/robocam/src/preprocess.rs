use std::sync::Arc;

use crate::{Result, SharedFrame};

/// A transformation applied to each frame as it is read.
pub trait FramePreprocessor: Send + Sync {
    fn process(&self, frame: SharedFrame) -> Result<SharedFrame>;
}

impl<F> FramePreprocessor for F
where
    F: Fn(SharedFrame) -> Result<SharedFrame> + Send + Sync,
{
    fn process(&self, frame: SharedFrame) -> Result<SharedFrame> {
        self(frame)
    }
}

/// Runs processors in the order they were added.
///
/// If a square image size is set, resizing happens before any processor.
#[derive(Default)]
pub struct PreprocessorChain {
    image_size: Option<u32>,
    processors: Vec<Box<dyn FramePreprocessor>>,
}

impl PreprocessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resize every frame to `size`x`size` before the other processors run.
    pub fn with_image_size(mut self, size: u32) -> Self {
        self.image_size = Some(size);
        self
    }

    pub fn add_processor<P: FramePreprocessor + 'static>(&mut self, processor: P) {
        self.processors.push(Box::new(processor));
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty() && self.image_size.is_none()
    }
}

impl FramePreprocessor for PreprocessorChain {
    fn process(&self, frame: SharedFrame) -> Result<SharedFrame> {
        let mut frame = match self.image_size {
            Some(size) if frame.width() != size || frame.height() != size => {
                let resized = image::imageops::resize(
                    &frame.image,
                    size,
                    size,
                    image::imageops::FilterType::Triangle,
                );
                Arc::new(frame.with_image(resized))
            }
            _ => frame,
        };
        for processor in self.processors.iter() {
            frame = processor.process(frame)?;
        }
        Ok(frame)
    }
}
