//! Decouple hardware frame production from frame consumption.
//!
//! A [FrameStream] owns one [robocam::FrameSource]. [FrameStream::start] opens
//! the source and spawns a single named thread which loops reading frames and
//! publishing each into a [FrameSlot]. Readers on any thread get the most
//! recent frame without waiting for the acquisition thread. Frames are a
//! "latest wins" resource: a slow reader sees repeats, a fast reader sees gaps.
//!
//! The acquisition thread exclusively owns the source between
//! [FrameStream::start] and [FrameStream::stop]. When the thread exits it
//! closes the source and hands it back over a channel so that the stream can
//! be restarted. [FrameStream::stop] waits for the hand-back for at most
//! [StreamConfig::join_timeout]. If the thread is stuck in a blocking read,
//! `stop` returns [robocam::Error::StopTimeout] and the thread is left to
//! release the device as soon as its read returns.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use robocam::{Error, FramePreprocessor, FrameSource, Result, SharedFrame};

mod slot;
pub use slot::FrameSlot;

/// Timing parameters of a [FrameStream].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Upper bound on how long [FrameStream::stop] waits for the acquisition
    /// thread.
    pub join_timeout: Duration,
    /// Pause after a failed read before trying again.
    pub retry_delay: Duration,
    /// Name of the acquisition thread. Defaults to one derived from the
    /// source name.
    pub thread_name: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_millis(5),
            thread_name: None,
        }
    }
}

/// State of a running acquisition thread.
struct Acquisition<S> {
    control: thread_control::Control,
    join_handle: std::thread::JoinHandle<()>,
    source_rx: crossbeam_channel::Receiver<S>,
}

pub struct FrameStream<S: FrameSource + 'static> {
    name: String,
    /// The source while no acquisition thread owns it.
    source: Option<S>,
    /// When acquiring, has value of Some, else None.
    acquisition: Option<Acquisition<S>>,
    /// A thread which did not finish within the join timeout.
    abandoned: Option<Acquisition<S>>,
    slot: FrameSlot,
    read_failures: Arc<AtomicU64>,
    preprocessor: Option<Box<dyn FramePreprocessor>>,
    config: StreamConfig,
}

fn _test_stream_is_send() {
    // Compile-time test to ensure FrameStream implements Send trait.
    fn implements<T: Send>() {}
    implements::<FrameStream<Box<dyn FrameSource>>>();
}

impl<S: FrameSource + 'static> FrameStream<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, StreamConfig::default())
    }

    pub fn with_config(source: S, config: StreamConfig) -> Self {
        Self {
            name: source.name().to_string(),
            source: Some(source),
            acquisition: None,
            abandoned: None,
            slot: FrameSlot::default(),
            read_failures: Arc::new(AtomicU64::new(0)),
            preprocessor: None,
            config,
        }
    }

    /// Apply `preprocessor` to each frame returned by
    /// [FrameStream::read_latest_frame].
    pub fn set_preprocessor<P: FramePreprocessor + 'static>(&mut self, preprocessor: P) {
        self.preprocessor = Some(Box::new(preprocessor));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle to the slot, for readers on other threads.
    ///
    /// Reading through the slot never starts the stream.
    pub fn slot(&self) -> FrameSlot {
        self.slot.clone()
    }

    /// Number of failed hardware reads since the stream was created.
    pub fn read_failure_count(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.acquisition
            .as_ref()
            .map(|a| !a.control.is_done())
            .unwrap_or(false)
    }

    /// Open the source and launch the acquisition thread.
    ///
    /// Calling this while running is a no-op. A failure to open the source is
    /// returned to the caller and no thread is started.
    pub fn start(&mut self) -> Result<()> {
        if self.acquisition.is_some() {
            if self.is_running() {
                return Ok(());
            }
            // The thread ended on its own (e.g. panicked). Collect it first.
            self.stop()?;
        }
        self.reclaim_abandoned(Duration::ZERO)?;

        let mut source = self.source.take().ok_or_else(|| {
            Error::DeviceUnavailable(format!("{}: source was lost by a failed stop", self.name))
        })?;

        if let Err(e) = source.open() {
            error!("{}: could not open source: {e}", self.name);
            self.source = Some(source);
            return Err(e);
        }

        self.slot.clear();

        let (flag, control) = thread_control::make_pair();
        let (source_tx, source_rx) = crossbeam_channel::bounded(1);
        let slot = self.slot.clone();
        let read_failures = self.read_failures.clone();
        let retry_delay = self.config.retry_delay;
        let name = self.name.clone();
        let thread_name = self
            .config
            .thread_name
            .clone()
            .unwrap_or_else(|| format!("FrameStream-{}", self.name));

        let join_handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                debug!("{name}: acquisition thread started");
                while flag.is_alive() {
                    match source.read_frame() {
                        Ok(frame) => {
                            let n = slot.publish(frame);
                            trace!("{name}: published frame {n}");
                        }
                        Err(e) => {
                            read_failures.fetch_add(1, Ordering::Relaxed);
                            if e.is_transient() {
                                trace!("{name}: skipping cycle: {e}");
                            } else {
                                debug!("{name}: read error: {e}");
                            }
                            std::thread::sleep(retry_delay);
                        }
                    }
                }
                if let Err(e) = source.close() {
                    warn!("{name}: error closing source: {e}");
                }
                debug!(
                    "closing thread {:?} ({:?})",
                    std::thread::current().name(),
                    std::thread::current().id(),
                );
                // The receiver is gone only if the stream itself was dropped.
                let _ = source_tx.send(source);
            })?;

        info!("{}: acquisition started", self.name);
        self.acquisition = Some(Acquisition {
            control,
            join_handle,
            source_rx,
        });
        Ok(())
    }

    /// Signal the acquisition thread to exit, wait for it and close the
    /// source.
    ///
    /// Safe to call repeatedly and on a stream which was never started.
    pub fn stop(&mut self) -> Result<()> {
        let Some(acquisition) = self.acquisition.take() else {
            return self.reclaim_abandoned(self.config.join_timeout);
        };
        acquisition.control.stop();
        self.finish(acquisition, self.config.join_timeout)
    }

    /// Return the most recently published frame, starting the stream first
    /// if needed.
    ///
    /// Never waits for a new frame. `Ok(None)` means nothing has been
    /// captured since the stream was started.
    pub fn read_latest_frame(&mut self) -> Result<Option<SharedFrame>> {
        if !self.is_running() {
            self.start()?;
        }
        let Some(frame) = self.slot.latest() else {
            return Ok(None);
        };
        match &self.preprocessor {
            Some(p) => Ok(Some(p.process(frame)?)),
            None => Ok(Some(frame)),
        }
    }

    fn finish(&mut self, acquisition: Acquisition<S>, timeout: Duration) -> Result<()> {
        match acquisition.source_rx.recv_timeout(timeout) {
            Ok(source) => {
                if acquisition.join_handle.join().is_err() {
                    error!("{}: acquisition thread panicked after exit", self.name);
                }
                self.source = Some(source);
                info!("{}: acquisition stopped", self.name);
                Ok(())
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                warn!(
                    "{}: acquisition thread did not stop within {:?}; it will release the device when its read returns",
                    self.name, timeout
                );
                self.abandoned = Some(acquisition);
                Err(Error::StopTimeout(timeout))
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                // The thread ended without returning the source.
                let _ = acquisition.join_handle.join();
                error!("{}: acquisition thread panicked, source lost", self.name);
                Ok(())
            }
        }
    }

    /// Collect a thread which previously missed its join deadline.
    fn reclaim_abandoned(&mut self, timeout: Duration) -> Result<()> {
        let Some(abandoned) = self.abandoned.take() else {
            return Ok(());
        };
        match self.finish(abandoned, timeout) {
            Err(Error::StopTimeout(_)) => Err(Error::PreviousStopPending),
            other => other,
        }
    }
}

impl<S: FrameSource + 'static> Drop for FrameStream<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{}: while dropping stream: {e}", self.name);
        }
    }
}
