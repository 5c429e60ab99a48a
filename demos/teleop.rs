// Keyboard teleop: WASD move, Z/X rotate, R/F speed, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use mecanum_base_bridge::config::TOPIC_CMD_VEL;
use mecanum_base_bridge::messages::Twist;
use std::time::{Duration, Instant};
use tracing::info;

const SPEEDS: [f64; 3] = [0.05, 0.15, 0.3]; // m/s
const YAW_RATES: [f64; 3] = [0.25, 0.75, 1.5]; // rad/s
const INPUT_TIMEOUT_MS: u64 = 100; // Stop after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_VEL).await?;

    info!("Controls: WASD=move, Z/X=rotate, R/F=speed, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut cmd = Twist::default();
    let mut last_movement_input = Instant::now();

    loop {
        // 20ms poll keeps the publish rate near 50Hz
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                let speed = SPEEDS[speed_idx];
                let yaw_rate = YAW_RATES[speed_idx];

                match code {
                    KeyCode::Char('w') if pressed => cmd.linear.x = speed,
                    KeyCode::Char('s') if pressed => cmd.linear.x = -speed,
                    KeyCode::Char('a') if pressed => cmd.linear.y = speed,
                    KeyCode::Char('d') if pressed => cmd.linear.y = -speed,
                    KeyCode::Char('z') if pressed => cmd.angular.z = yaw_rate,
                    KeyCode::Char('x') if pressed => cmd.angular.z = -yaw_rate,

                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                        continue;
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                        continue;
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => continue,
                }
                last_movement_input = Instant::now();
            }
        }

        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            cmd = Twist::default();
        }

        publisher.put(serde_json::to_string(&cmd)?).await?;
    }

    // Leave the base stopped
    publisher.put(serde_json::to_string(&Twist::default())?).await?;
    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
