// Bridge runtime: zenoh <-> serial board
// Commands are written to the board as they arrive; telemetry decoded by the
// receiver thread is published as it comes in; health goes out once a second.

use std::sync::Arc;

use serde::Serialize;
use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use zenoh::pubsub::Publisher;

// local imports
use crate::board::link::{CommandWriter, SerialLink};
use crate::board::protocol::CommandFrame;
use crate::config::{
    BridgeConfig, HEALTH_PERIOD, TELEMETRY_CAPACITY, TOPIC_CMD_VEL, TOPIC_HEALTH, TOPIC_IMU,
    TOPIC_ODOM,
};
use crate::imu::{ImuSource, NullImu};
use crate::messages::{BridgeHealth, LinkStatus, Telemetry, Twist};
use crate::receiver::{LinkCounters, ReceiverHandle, ReceiverLoop};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Serial side of the bridge. Inert when the port could not be opened.
pub struct Bridge {
    receiver: Option<ReceiverHandle>,
    writer: Option<CommandWriter<Box<dyn SerialPort>>>,
    counters: Option<Arc<LinkCounters>>,
    commands_failed: u64,
}

impl Bridge {
    /// Open the port, bring up the IMU and start the receiver thread
    pub async fn start<I>(
        config: &BridgeConfig,
        mut imu: I,
        telemetry: mpsc::Sender<Telemetry>,
    ) -> Result<Self, BoxError>
    where
        I: ImuSource + 'static,
    {
        let link = match SerialLink::open(&config.port, config.baud, config.read_timeout) {
            Ok(link) => {
                info!("Serial port {} opened", config.port);
                Some(link)
            }
            Err(e) => {
                error!("{}", e);
                error!("Could not open serial connection to the motor controller board");
                None
            }
        };

        // Settling the IMU sleeps, keep it off the async workers
        let settle = config.imu_settle;
        let imu = tokio::task::spawn_blocking(move || {
            crate::imu::bring_up(&mut imu, settle);
            imu
        })
        .await?;

        let Some(link) = link else {
            return Ok(Self::inert());
        };

        if let Err(e) = link.flush_input() {
            warn!("Failed to flush serial input: {}", e);
        }

        let receiver = ReceiverLoop::new(link.reader, imu, telemetry, config.calibration);
        let counters = receiver.counters();
        let handle = match receiver.spawn() {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to start receiver thread: {}", e);
                None
            }
        };

        Ok(Self {
            receiver: handle,
            writer: Some(CommandWriter::new(link.writer)),
            counters: Some(counters),
            commands_failed: 0,
        })
    }

    fn inert() -> Self {
        Self {
            receiver: None,
            writer: None,
            counters: None,
            commands_failed: 0,
        }
    }

    /// Forward one velocity command to the board. Failures are logged and the command dropped.
    pub fn on_command(&mut self, cmd: &Twist) {
        debug!("Received command: {:?}", cmd);
        let Some(writer) = self.writer.as_mut() else {
            debug!("Serial link unavailable, dropping command");
            self.commands_failed += 1;
            return;
        };

        if let Err(e) = writer.send(CommandFrame::from(cmd)) {
            error!("Unable to send command through serial port: {}", e);
            self.commands_failed += 1;
        }
    }

    pub fn health(&self) -> BridgeHealth {
        let read_failures = self.counters.as_ref().map_or(0, |c| c.read_failures());
        let status = match self.receiver {
            Some(ref handle) if handle.is_finished() => LinkStatus::SerialUnavailable,
            Some(_) if read_failures > 0 => LinkStatus::SerialIoError,
            Some(_) => LinkStatus::Ok,
            None => LinkStatus::SerialUnavailable,
        };
        BridgeHealth {
            status,
            frames_decoded: self.counters.as_ref().map_or(0, |c| c.decoded()),
            frames_rejected: self.counters.as_ref().map_or(0, |c| c.rejected()),
            commands_sent: self.writer.as_ref().map_or(0, |w| w.sent()),
            commands_failed: self.commands_failed,
        }
    }

    /// Stop the receiver, wait for it, then release the port
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.receiver.take() {
            info!("Stopping receiver loop...");
            match tokio::task::spawn_blocking(move || handle.shutdown()).await {
                Ok(stats) => info!(
                    "Receiver joined: {} frames decoded, {} tail errors, {} checksum errors",
                    stats.decoded, stats.tail_errors, stats.checksum_errors
                ),
                Err(e) => error!("Failed to join receiver loop: {}", e),
            }
        }

        if self.writer.take().is_some() {
            info!("Serial port released");
        }
    }
}

async fn put_json<T: Serialize>(publisher: &Publisher<'_>, value: &T) {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize message: {}", e);
            return;
        }
    };
    if let Err(e) = publisher.put(json).await {
        warn!("Failed to publish on {}: {}", publisher.key_expr(), e);
    }
}

pub async fn run(config: BridgeConfig) -> Result<(), BoxError> {
    run_with_imu(config, NullImu).await
}

pub async fn run_with_imu<I>(config: BridgeConfig, imu: I) -> Result<(), BoxError>
where
    I: ImuSource + 'static,
{
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_VEL).await?;
    let pub_odom = session.declare_publisher(TOPIC_ODOM).await?;
    let pub_imu = session.declare_publisher(TOPIC_IMU).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let (telemetry_tx, mut telemetry_rx) = mpsc::channel(TELEMETRY_CAPACITY);
    let mut bridge = Bridge::start(&config, imu, telemetry_tx).await?;
    let mut health_tick = interval(HEALTH_PERIOD);

    info!("Subscribed to: {}", TOPIC_CMD_VEL);
    info!("Publishing to: {}, {}, {}", TOPIC_ODOM, TOPIC_IMU, TOPIC_HEALTH);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            sample = subscriber.recv_async() => {
                let sample = match sample {
                    Ok(sample) => sample,
                    Err(e) => {
                        warn!("Command subscriber closed: {}", e);
                        break;
                    }
                };
                let payload = sample.payload().to_bytes();
                match serde_json::from_slice::<Twist>(&payload) {
                    Ok(cmd) => bridge.on_command(&cmd),
                    Err(e) => warn!("Failed to parse command: {}", e),
                }
            }
            Some(telemetry) = telemetry_rx.recv() => match telemetry {
                Telemetry::Odometry(odom) => put_json(&pub_odom, &odom).await,
                Telemetry::Imu(imu) => put_json(&pub_imu, &imu).await,
            },
            _ = health_tick.tick() => put_json(&pub_health, &bridge.health()).await,
        }
    }

    bridge.shutdown().await;
    session.close().await?;
    info!("Bridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Calibration;
    use crate::messages::Vector3;
    use std::io::{self, Read};
    use std::time::{Duration, Instant};

    /// Port whose every read fails, as after the device is unplugged
    struct UnpluggedPort;

    impl Read for UnpluggedPort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(1));
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"))
        }
    }

    #[test]
    fn test_failing_reads_reported_in_health() {
        let (tx, _rx) = mpsc::channel(4);
        let receiver = ReceiverLoop::new(UnpluggedPort, NullImu, tx, Calibration::default());
        let counters = receiver.counters();
        let bridge = Bridge {
            receiver: Some(receiver.spawn().unwrap()),
            writer: None,
            counters: Some(counters),
            commands_failed: 0,
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while bridge.health().status == LinkStatus::Ok && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(bridge.health().status, LinkStatus::SerialIoError);

        if let Some(handle) = bridge.receiver {
            handle.shutdown();
        }
    }

    #[test]
    fn test_inert_bridge_drops_commands() {
        let mut bridge = Bridge::inert();
        bridge.on_command(&Twist {
            linear: Vector3::new(0.1, 0.0, 0.0),
            angular: Vector3::default(),
        });

        let health = bridge.health();
        assert_eq!(health.status, LinkStatus::SerialUnavailable);
        assert_eq!(health.commands_sent, 0);
        assert_eq!(health.commands_failed, 1);
        assert_eq!(health.frames_decoded, 0);
    }

    #[tokio::test]
    async fn test_unopenable_port_leaves_bridge_inert() {
        let config = BridgeConfig {
            port: "/dev/nonexistent-mecanum-board".to_string(),
            imu_settle: std::time::Duration::ZERO,
            ..BridgeConfig::default()
        };
        let (tx, mut rx) = mpsc::channel(4);

        let bridge = Bridge::start(&config, NullImu, tx).await.unwrap();
        assert_eq!(bridge.health().status, LinkStatus::SerialUnavailable);

        // The sender was dropped with the unopened link: no telemetry, ever
        assert!(rx.recv().await.is_none());
        bridge.shutdown().await;
    }
}
