//! Synthetic two-device race: runs a Start-side and Finish-side session
//! entirely in one process, talking over an in-memory loopback pair instead
//! of the real relay, each driving its own `Det` against generated frames.
//! Useful for exercising the full pairing → sync → armed → running →
//! finished pipeline without cameras, a network, or a second machine.

mod frame_gen;
mod loopback;

use std::time::Duration;

use clap::Parser;
use tracing::info;

use frame_gen::{generate_frames, FrameGenConfig};
use loopback::LoopbackBus;
use timer_core::{Det, RaceAuditLog, RaceEventType, Sess};
use timer_types::Role;

#[derive(Parser, Debug)]
#[command(name = "timer-sim", about = "Synthetic photo-finish race harness")]
struct Args {
    /// Simulated camera frame rate.
    #[arg(long, default_value_t = 240.0)]
    fps: f64,
    /// Frame width in pixels.
    #[arg(long, default_value_t = 320)]
    width: usize,
    /// Frame height in pixels.
    #[arg(long, default_value_t = 480)]
    height: usize,
    /// Gate column as a fraction of frame width.
    #[arg(long, default_value_t = 0.5)]
    gate_line_x: f64,
    /// Simulated time between the start and finish crossings, in seconds.
    #[arg(long, default_value_t = 8.5)]
    race_seconds: f64,
}

fn run_until_crossing(det: &mut Det, frames: &[timer_core::Frame]) -> Option<timer_core::CrossingInfo> {
    for frame in frames {
        let result = det.process(frame).expect("frame matches armed dimensions");
        if result.crossed {
            return result.crossing;
        }
    }
    None
}

async fn calibrate_and_arm(det: &mut Det, cfg: &FrameGenConfig, audit: &RaceAuditLog, gate: &str) {
    let frames = generate_frames(cfg, 1.0);
    det.start_calibration(&frames[0]).expect("frame meets the minimum size for calibration");
    let mut complete = false;
    for frame in frames.iter().take(45) {
        complete = det.calibrate(frame).expect("calibration frame").complete;
    }
    assert!(complete, "calibration did not converge in 45 frames");
    audit.append(RaceEventType::CalibrationComplete, serde_json::json!({ "gate": gate })).await;
    det.arm(frames.last().expect("at least one calibration frame")).expect("arm requires calibrated bg");
    audit.append(RaceEventType::Armed, serde_json::json!({ "gate": gate })).await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "timer_sim=info".into()),
        )
        .init();

    let args = Args::parse();

    let audit = RaceAuditLog::new(
        std::env::temp_dir().join("timer-sim-audit.jsonl").to_string_lossy().to_string(),
    );

    let (start_transport, finish_transport, bus) = LoopbackBus::new_pair();
    let mut start_sess = Sess::with_transport(Role::Start, Box::new(start_transport));
    let mut finish_sess = Sess::with_transport(Role::Finish, Box::new(finish_transport));

    let code = start_sess.create_room();
    finish_sess.join_room(&code);
    bus.pump(&mut start_sess, &mut finish_sess);
    audit.set_session(code.clone()).await;
    info!("paired on room {code}");

    start_sess.start_sync();
    finish_sess.start_sync();
    // Both sides burst pings on a ~30ms cadence in the real app; here we
    // just drain the burst as fast as the loopback bus allows.
    for _ in 0..100 {
        if let Some(ping) = start_sess.tick_sync_burst() {
            finish_sess.on_message(ping);
        }
        if let Some(ping) = finish_sess.tick_sync_burst() {
            start_sess.on_message(ping);
        }
        bus.pump(&mut start_sess, &mut finish_sess);
        if start_sess.sync_status().is_ready && finish_sess.sync_status().is_ready {
            break;
        }
    }
    info!(
        "sync settled: start quality {:?}, finish quality {:?}",
        start_sess.sync_quality(),
        finish_sess.sync_quality()
    );

    start_sess.arm().expect("both devices paired, ready to arm start");
    finish_sess.arm().expect("both devices paired, ready to arm finish");

    let mut start_det = Det::new();
    let mut finish_det = Det::new();
    start_det.configure(args.gate_line_x);
    finish_det.configure(args.gate_line_x);

    let cal_cfg = FrameGenConfig::background_only(args.width, args.height, args.fps);
    calibrate_and_arm(&mut start_det, &cal_cfg, &audit, "start").await;
    calibrate_and_arm(&mut finish_det, &cal_cfg, &audit, "finish").await;

    let start_cross_cfg = FrameGenConfig::with_crossing(args.width, args.height, args.fps, 0.2);
    let start_frames = generate_frames(&start_cross_cfg, 1.0);
    let start_crossing =
        run_until_crossing(&mut start_det, &start_frames).expect("subject crosses the start gate");
    audit
        .append(RaceEventType::Triggered, serde_json::json!({ "gate": "start", "pts": start_crossing.trigger_pts }))
        .await;
    start_sess
        .on_crossing(start_crossing.trigger_pts, start_crossing.pts_seconds, start_crossing.uptime_nanos)
        .expect("start crossing accepted while armed");
    bus.pump(&mut start_sess, &mut finish_sess);
    info!("start crossing at pts {:.4}s", start_crossing.trigger_pts);

    tokio::time::sleep(Duration::from_millis(20)).await;

    let finish_cross_cfg =
        FrameGenConfig::with_crossing(args.width, args.height, args.fps, args.race_seconds);
    let finish_frames = generate_frames(&finish_cross_cfg, args.race_seconds + 1.0);
    let finish_crossing =
        run_until_crossing(&mut finish_det, &finish_frames).expect("subject crosses the finish gate");
    audit
        .append(
            RaceEventType::Triggered,
            serde_json::json!({ "gate": "finish", "pts": finish_crossing.trigger_pts }),
        )
        .await;
    let outcome = finish_sess
        .on_crossing(finish_crossing.trigger_pts, finish_crossing.pts_seconds, finish_crossing.uptime_nanos)
        .expect("finish crossing accepted while running");
    bus.pump(&mut start_sess, &mut finish_sess);

    match outcome.or_else(|| start_sess.finish_outcome()) {
        Some(result) => {
            audit.log_finish_result(result.split_nanos, result.uncertainty_ms).await;
            println!(
                "split: {} ns ({:.4}s), uncertainty +/-{:.2}ms",
                result.split_nanos,
                result.split_nanos as f64 / 1e9,
                result.uncertainty_ms
            );
        }
        None => println!("no finish result recorded"),
    }
}
