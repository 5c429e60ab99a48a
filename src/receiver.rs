// Serial receive loop
//
// Runs on its own OS thread: reads the board's byte stream one byte at a
// time, decodes frames, integrates odometry and hands odometry + IMU
// records to a telemetry sink. The stop flag is checked between reads, so
// shutdown latency is bounded by the port's read timeout.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::board::kinematics::{BaseGeometry, OdometryIntegrator};
use crate::board::protocol::{FrameDecoder, FrameStats, WheelSample};
use crate::config::Calibration;
use crate::imu::{ImuCalibration, ImuSource};
use crate::messages::{Odometry, Telemetry};

/// Destination for telemetry produced by the receiver thread
pub trait TelemetrySink: Send + 'static {
    fn emit(&mut self, telemetry: Telemetry);
}

// Never blocks the serial thread: when the publisher falls behind, records are dropped
impl TelemetrySink for mpsc::Sender<Telemetry> {
    fn emit(&mut self, telemetry: Telemetry) {
        if let Err(e) = self.try_send(telemetry) {
            debug!("Telemetry dropped: {}", e);
        }
    }
}

/// Frame counters readable from outside the receiver thread
#[derive(Debug, Default)]
pub struct LinkCounters {
    decoded: AtomicU64,
    rejected: AtomicU64,
    read_failures: AtomicU64,
}

impl LinkCounters {
    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Length of the current streak of failed serial reads; 0 once a read succeeds
    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    fn record(&self, stats: &FrameStats) {
        self.decoded.store(stats.decoded, Ordering::Relaxed);
        self.rejected.store(stats.rejected(), Ordering::Relaxed);
    }
}

/// State owned by the receive thread. Pose and decode buffer never leave it.
pub struct ReceiverLoop<R, I, S> {
    port: R,
    decoder: FrameDecoder,
    geometry: BaseGeometry,
    odometry: OdometryIntegrator,
    imu: I,
    imu_calibration: ImuCalibration,
    sink: S,
    counters: Arc<LinkCounters>,
}

impl<R, I, S> ReceiverLoop<R, I, S>
where
    R: Read + Send + 'static,
    I: ImuSource + 'static,
    S: TelemetrySink,
{
    pub fn new(port: R, imu: I, sink: S, calibration: Calibration) -> Self {
        Self {
            port,
            decoder: FrameDecoder::new(),
            geometry: calibration.geometry,
            odometry: OdometryIntegrator::new(),
            imu,
            imu_calibration: calibration.imu,
            sink,
            counters: Arc::new(LinkCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<LinkCounters> {
        Arc::clone(&self.counters)
    }

    /// Start the loop on a dedicated thread
    pub fn spawn(self) -> io::Result<ReceiverHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("serial-rx".to_string())
            .spawn(move || self.run(&thread_stop))?;

        Ok(ReceiverHandle { stop, thread })
    }

    fn run(mut self, stop: &AtomicBool) -> FrameStats {
        info!("Receiver loop started");
        let mut byte = [0u8; 1];
        let mut last_frame_at = Instant::now();

        while !stop.load(Ordering::Acquire) {
            match self.port.read(&mut byte) {
                Ok(1) => {
                    self.counters.read_failures.store(0, Ordering::Relaxed);
                    match self.decoder.push(byte[0]) {
                        Some(Ok(sample)) => self.on_sample(&sample, &mut last_frame_at),
                        Some(Err(e)) => {
                            error!(
                                "Frame rejected: {} ({} rejected so far)",
                                e,
                                self.decoder.stats().rejected()
                            );
                            self.counters.record(&self.decoder.stats());
                        }
                        None => {}
                    }
                }
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    // Only the first error of a streak is worth a log line
                    if self.counters.read_failures.fetch_add(1, Ordering::Relaxed) == 0 {
                        warn!("Serial read failed: {}", e);
                    }
                }
            }
        }

        let stats = self.decoder.stats();
        info!(
            "Receiver loop stopped: {} frames decoded, {} rejected",
            stats.decoded,
            stats.rejected()
        );
        stats
    }

    fn on_sample(&mut self, sample: &WheelSample, last_frame_at: &mut Instant) {
        let dt = sample.received_at.duration_since(*last_frame_at).as_secs_f64();
        *last_frame_at = sample.received_at;

        let velocity = self.geometry.body_velocity_of(sample);
        let pose = self.odometry.update(dt, velocity);
        self.counters.record(&self.decoder.stats());

        let imu = match self.imu.poll() {
            Ok(reading) => Some(self.imu_calibration.to_message(&reading)),
            Err(e) => {
                warn!("IMU read failed: {}", e);
                None
            }
        };

        self.sink.emit(Telemetry::Odometry(Odometry::new(pose, velocity)));
        if let Some(imu) = imu {
            self.sink.emit(Telemetry::Imu(imu));
        }
    }
}

/// Owner's handle on a running receiver loop
pub struct ReceiverHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<FrameStats>,
}

impl ReceiverHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Signal stop and wait for the loop to exit. Blocks for at most one read timeout.
    pub fn shutdown(self) -> FrameStats {
        self.stop.store(true, Ordering::Release);
        match self.thread.join() {
            Ok(stats) => stats,
            Err(_) => {
                error!("Receiver thread panicked");
                FrameStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::kinematics::WHEEL_RADIUS;
    use crate::board::protocol::tests::board_frame;
    use crate::imu::{ImuError, ImuKind, ImuReading, NullImu};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Serial double: serves scripted bytes, then times out like an idle port
    struct ScriptedPort {
        bytes: VecDeque<u8>,
        timeout: Duration,
        pace: Duration,
    }

    impl ScriptedPort {
        fn new(bytes: &[u8], timeout: Duration) -> Self {
            Self {
                bytes: bytes.iter().copied().collect(),
                timeout,
                pace: Duration::ZERO,
            }
        }

        /// Delay every byte, like a slow baud rate
        fn paced(mut self, pace: Duration) -> Self {
            self.pace = pace;
            self
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.bytes.pop_front() {
                Some(b) => {
                    thread::sleep(self.pace);
                    buf[0] = b;
                    Ok(1)
                }
                None => {
                    thread::sleep(self.timeout);
                    Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
                }
            }
        }
    }

    /// Serial double for an unplugged device: fails a number of reads, then idles
    struct UnpluggedPort {
        failures_left: Option<u32>,
    }

    impl Read for UnpluggedPort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(1));
            match self.failures_left {
                Some(0) => Err(io::Error::new(io::ErrorKind::TimedOut, "timed out")),
                Some(ref mut n) => {
                    *n -= 1;
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"))
                }
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone")),
            }
        }
    }

    struct FailingImu;

    impl ImuSource for FailingImu {
        fn init(&mut self) -> Result<ImuKind, ImuError> {
            Err(ImuError::NotDetected)
        }

        fn poll(&mut self) -> Result<ImuReading, ImuError> {
            Err(ImuError::NotDetected)
        }
    }

    fn recv(rx: &mut mpsc::Receiver<Telemetry>) -> Telemetry {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match rx.try_recv() {
                Ok(t) => return t,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("no telemetry: {}", e),
            }
        }
    }

    #[test]
    fn test_frames_produce_odometry_and_imu() {
        let frame = board_frame([1000; 4]);
        let bytes: Vec<u8> = frame.iter().chain(frame.iter()).copied().collect();
        let (tx, mut rx) = mpsc::channel(16);

        let receiver = ReceiverLoop::new(
            ScriptedPort::new(&bytes, Duration::from_millis(5)).paced(Duration::from_micros(200)),
            NullImu,
            tx,
            Calibration::default(),
        );
        let counters = receiver.counters();
        let handle = receiver.spawn().unwrap();

        let mut positions = Vec::new();
        for _ in 0..2 {
            match recv(&mut rx) {
                Telemetry::Odometry(odom) => {
                    assert!((odom.twist.twist.linear.x - WHEEL_RADIUS).abs() < 1e-12);
                    assert_eq!(odom.twist.twist.linear.y, 0.0);
                    assert_eq!(odom.twist.twist.angular.z, 0.0);
                    assert_eq!(odom.pose.position.y, 0.0);
                    assert_eq!(odom.pose.orientation.z, 0.0);
                    positions.push(odom.pose.position.x);
                }
                other => panic!("expected odometry, got {:?}", other),
            }
            match recv(&mut rx) {
                Telemetry::Imu(imu) => assert_eq!(imu.header.frame_id, "imu_link"),
                other => panic!("expected imu, got {:?}", other),
            }
        }

        // Each record carries the pose after integrating its own frame
        assert!(positions[0] > 0.0);
        assert!(positions[1] > positions[0]);

        let stats = handle.shutdown();
        assert_eq!(stats.decoded, 2);
        assert_eq!(counters.decoded(), 2);
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_failing_reads_are_counted() {
        let (tx, _rx) = mpsc::channel(16);
        let receiver = ReceiverLoop::new(
            UnpluggedPort { failures_left: None },
            NullImu,
            tx,
            Calibration::default(),
        );
        let counters = receiver.counters();
        let handle = receiver.spawn().unwrap();

        assert!(wait_for(|| counters.read_failures() >= 3));
        assert!(!handle.is_finished());
        handle.shutdown();
    }

    #[test]
    fn test_read_failure_streak_resets_on_data() {
        let frame = board_frame([0; 4]);
        let (tx, mut rx) = mpsc::channel(16);
        let receiver = ReceiverLoop::new(
            ChainedPort {
                first: UnpluggedPort { failures_left: Some(5) },
                then: ScriptedPort::new(&frame, Duration::from_millis(5)),
                switched: false,
            },
            NullImu,
            tx,
            Calibration::default(),
        );
        let counters = receiver.counters();
        let handle = receiver.spawn().unwrap();

        assert!(matches!(recv(&mut rx), Telemetry::Odometry(_)));
        assert_eq!(counters.read_failures(), 0);
        handle.shutdown();
    }

    /// Reads from `first` until it starts timing out, then from `then`
    struct ChainedPort {
        first: UnpluggedPort,
        then: ScriptedPort,
        switched: bool,
    }

    impl Read for ChainedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.switched {
                match self.first.read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => self.switched = true,
                    other => return other,
                }
            }
            self.then.read(buf)
        }
    }

    #[test]
    fn test_imu_failure_still_emits_odometry() {
        let (tx, mut rx) = mpsc::channel(16);
        let receiver = ReceiverLoop::new(
            ScriptedPort::new(&board_frame([0; 4]), Duration::from_millis(5)),
            FailingImu,
            tx,
            Calibration::default(),
        );
        let handle = receiver.spawn().unwrap();

        assert!(matches!(recv(&mut rx), Telemetry::Odometry(_)));
        handle.shutdown();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_corrupt_frame_emits_nothing() {
        let mut frame = board_frame([1000; 4]);
        frame[9] ^= 0x01;
        let (tx, mut rx) = mpsc::channel(16);
        let receiver = ReceiverLoop::new(
            ScriptedPort::new(&frame, Duration::from_millis(5)),
            NullImu,
            tx,
            Calibration::default(),
        );
        let counters = receiver.counters();
        let handle = receiver.spawn().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while counters.rejected() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let stats = handle.shutdown();
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.decoded, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_shutdown_while_idle_is_prompt() {
        let timeout = Duration::from_millis(50);
        let (tx, _rx) = mpsc::channel(16);
        let receiver = ReceiverLoop::new(
            ScriptedPort::new(&[], timeout),
            NullImu,
            tx,
            Calibration::default(),
        );
        let handle = receiver.spawn().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert!(!handle.is_finished());

        let started = Instant::now();
        handle.shutdown();
        // One read timeout plus scheduling slack
        assert!(started.elapsed() < timeout + Duration::from_millis(500));
    }
}
