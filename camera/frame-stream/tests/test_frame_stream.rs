use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use frame_stream::{FrameStream, StreamConfig};
use robocam::{Error, Frame, FrameSource, Result};
use test_log::test;

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl Counters {
    fn open_handles(&self) -> usize {
        self.opens.load(Ordering::SeqCst) - self.closes.load(Ordering::SeqCst)
    }
}

/// Produces `limit` frames per open, then only read failures.
struct StubSource {
    counters: Arc<Counters>,
    limit: usize,
    produced: usize,
    open: bool,
    fail_open: bool,
    gate: Option<crossbeam_channel::Receiver<()>>,
    entered: Option<crossbeam_channel::Sender<()>>,
}

impl StubSource {
    fn new(counters: Arc<Counters>, limit: usize) -> Self {
        Self {
            counters,
            limit,
            produced: 0,
            open: false,
            fail_open: false,
            gate: None,
            entered: None,
        }
    }
}

impl FrameSource for StubSource {
    fn name(&self) -> &str {
        "stub"
    }
    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(Error::DeviceUnavailable("no such camera".into()));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.produced = 0;
        self.open = true;
        Ok(())
    }
    fn close(&mut self) -> Result<()> {
        if self.open {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            self.open = false;
        }
        Ok(())
    }
    fn is_open(&self) -> bool {
        self.open
    }
    fn read_frame(&mut self) -> Result<Frame> {
        if let Some(entered) = &self.entered {
            let _ = entered.send(());
        }
        if let Some(gate) = &self.gate {
            // Simulates a read stuck in the driver.
            let _ = gate.recv();
        }
        if self.produced >= self.limit {
            return Err(Error::ReadFailure("no more frames".into()));
        }
        let frame = Frame::new(image::RgbImage::new(4, 3), self.produced);
        self.produced += 1;
        Ok(frame)
    }
}

fn quick_config() -> StreamConfig {
    StreamConfig {
        join_timeout: Duration::from_secs(2),
        retry_delay: Duration::from_millis(1),
        thread_name: Some("test-acquisition".into()),
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn read_returns_last_published_frame() {
    let counters = Arc::new(Counters::default());
    let mut stream = FrameStream::with_config(StubSource::new(counters.clone(), 7), quick_config());
    stream.start().unwrap();
    let slot = stream.slot();
    wait_for(|| slot.published_count() == 7);

    let frame = stream.read_latest_frame().unwrap().unwrap();
    assert_eq!(frame.host_timing.fno, 6);
    assert!(stream.read_failure_count() > 0);
    stream.stop().unwrap();
    assert_eq!(counters.open_handles(), 0);
}

#[test]
fn first_read_starts_the_stream() {
    let counters = Arc::new(Counters::default());
    let mut stream = FrameStream::with_config(StubSource::new(counters.clone(), 3), quick_config());
    assert!(!stream.is_running());
    // Nothing has been captured yet, but the read must not block or fail.
    let _ = stream.read_latest_frame().unwrap();
    assert!(stream.is_running());
    let slot = stream.slot();
    wait_for(|| slot.published_count() == 3);
    assert!(stream.read_latest_frame().unwrap().is_some());
}

#[test]
fn restart_cycles_do_not_leak_handles() {
    let counters = Arc::new(Counters::default());
    let mut stream = FrameStream::with_config(StubSource::new(counters.clone(), 2), quick_config());
    for _ in 0..5 {
        stream.start().unwrap();
        assert!(counters.open_handles() <= 1);
        let slot = stream.slot();
        wait_for(|| slot.latest().is_some());
        stream.stop().unwrap();
        assert_eq!(counters.open_handles(), 0);
    }
    assert_eq!(counters.opens.load(Ordering::SeqCst), 5);
}

#[test]
fn stop_without_start_is_harmless() {
    let counters = Arc::new(Counters::default());
    let mut stream = FrameStream::new(StubSource::new(counters.clone(), 1));
    stream.stop().unwrap();
    stream.stop().unwrap();
    assert_eq!(counters.opens.load(Ordering::SeqCst), 0);
}

#[test]
fn open_failure_is_reported_to_caller() {
    let counters = Arc::new(Counters::default());
    let mut source = StubSource::new(counters.clone(), 1);
    source.fail_open = true;
    let mut stream = FrameStream::with_config(source, quick_config());
    assert!(matches!(stream.start(), Err(Error::DeviceUnavailable(_))));
    assert!(!stream.is_running());
    assert!(matches!(
        stream.read_latest_frame(),
        Err(Error::DeviceUnavailable(_))
    ));
}

#[test]
fn stuck_read_is_bounded_by_join_timeout() {
    let counters = Arc::new(Counters::default());
    let (unblock, gate) = crossbeam_channel::unbounded();
    let (entered_tx, entered) = crossbeam_channel::unbounded();
    let mut source = StubSource::new(counters.clone(), 1);
    source.gate = Some(gate);
    source.entered = Some(entered_tx);
    let config = StreamConfig {
        join_timeout: Duration::from_millis(50),
        ..quick_config()
    };
    let mut stream = FrameStream::with_config(source, config);
    stream.start().unwrap();
    // Only stop once the thread is blocked inside the read.
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    let t0 = Instant::now();
    assert!(matches!(stream.stop(), Err(Error::StopTimeout(_))));
    assert!(t0.elapsed() < Duration::from_secs(1));
    assert!(matches!(stream.start(), Err(Error::PreviousStopPending)));

    // Let the stuck read return; the thread then releases the device.
    unblock.send(()).unwrap();
    stream.stop().unwrap();
    assert_eq!(counters.open_handles(), 0);
    drop(unblock);
    stream.start().unwrap();
    stream.stop().unwrap();
}

#[test]
fn preprocessor_applies_to_reads() {
    let counters = Arc::new(Counters::default());
    let mut stream = FrameStream::with_config(StubSource::new(counters, 1), quick_config());
    stream.set_preprocessor(|frame: Arc<Frame>| -> Result<Arc<Frame>> {
        let img = image::imageops::resize(&frame.image, 2, 2, image::imageops::FilterType::Nearest);
        Ok(Arc::new(frame.with_image(img)))
    });
    stream.start().unwrap();
    let slot = stream.slot();
    wait_for(|| slot.latest().is_some());
    let frame = stream.read_latest_frame().unwrap().unwrap();
    assert_eq!((frame.width(), frame.height()), (2, 2));
    // The slot itself keeps the raw frame.
    assert_eq!(slot.latest().unwrap().width(), 4);
}
