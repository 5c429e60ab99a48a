// Frame monitor: READ-ONLY view of the board's telemetry stream
//
// Opens the serial port directly (stop the bridge first), decodes frames and
// prints wheel velocities with the derived body velocity. Nothing is written.
//
// Usage: cargo run --example frame_monitor -- [port] [baud]

use mecanum_base_bridge::board::{BaseGeometry, FrameDecoder, SerialLink};
use mecanum_base_bridge::config::{READ_TIMEOUT_MS, SERIAL_BAUDRATE, SERIAL_PORT};
use std::io::{ErrorKind, Read};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| SERIAL_PORT.to_string());
    let baud = match args.next() {
        Some(b) => b.parse()?,
        None => SERIAL_BAUDRATE,
    };

    println!("Serial port: {} @ {} baud", port, baud);
    let mut link = SerialLink::open(&port, baud, Duration::from_millis(READ_TIMEOUT_MS))?;
    link.flush_input()?;
    println!("Waiting for frames (Ctrl+C to quit)...");
    println!();

    let geometry = BaseGeometry::default();
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 64];

    loop {
        let n = match link.reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.into()),
        };

        for &byte in &buf[..n] {
            match decoder.push(byte) {
                Some(Ok(sample)) => {
                    let v = geometry.body_velocity(sample.wheels);
                    println!(
                        "wheels [{:+.3} {:+.3} {:+.3} {:+.3}] m/s  body x={:+.4} y={:+.4} z={:+.4}",
                        sample.wheels[0], sample.wheels[1], sample.wheels[2], sample.wheels[3],
                        v.x, v.y, v.z
                    );
                }
                Some(Err(e)) => {
                    let stats = decoder.stats();
                    println!(
                        "✗ {} (decoded {}, tail errors {}, checksum errors {})",
                        e, stats.decoded, stats.tail_errors, stats.checksum_errors
                    );
                }
                None => {}
            }
        }
    }
}
