//! Synthetic luma frame generator. Produces a fixed-background frame
//! stream with a rectangular "subject" occluding the measurement band for
//! a short window, noisy enough to exercise DET's foreground threshold and
//! minimum-run filter instead of tripping on a perfectly clean step.

use rand_distr::{Distribution, Normal};
use timer_core::Frame;

pub struct FrameGenConfig {
    pub width: usize,
    pub height: usize,
    pub fps: f64,
    pub background_luma: f64,
    pub subject_luma: f64,
    pub noise_std: f64,
    /// Session-relative pts at which the subject starts occluding the band.
    pub crossing_pts: f64,
    /// How long the subject stays in the band.
    pub crossing_duration: f64,
}

impl FrameGenConfig {
    pub fn background_only(width: usize, height: usize, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            background_luma: 40.0,
            subject_luma: 220.0,
            noise_std: 2.0,
            crossing_pts: f64::INFINITY,
            crossing_duration: 0.0,
        }
    }

    pub fn with_crossing(width: usize, height: usize, fps: f64, crossing_pts: f64) -> Self {
        Self { crossing_duration: 0.08, crossing_pts, ..Self::background_only(width, height, fps) }
    }
}

/// Generates `duration` seconds of frames starting at session pts `0.0`.
pub fn generate_frames(cfg: &FrameGenConfig, duration: f64) -> Vec<Frame> {
    let dt = 1.0 / cfg.fps;
    let count = (duration / dt).ceil().max(1.0) as usize;
    let mut rng = rand::thread_rng();
    let noise = Normal::new(0.0, cfg.noise_std).unwrap();

    let mut frames = Vec::with_capacity(count);
    for i in 0..count {
        let pts = i as f64 * dt;
        let occluded = pts >= cfg.crossing_pts && pts < cfg.crossing_pts + cfg.crossing_duration;
        let base = if occluded { cfg.subject_luma } else { cfg.background_luma };
        let mut luma = vec![0u8; cfg.width * cfg.height];
        for px in luma.iter_mut() {
            let sample: f64 = noise.sample(&mut rng);
            *px = (base + sample).clamp(0.0, 255.0) as u8;
        }
        frames.push(Frame { width: cfg.width, height: cfg.height, pts, luma });
    }
    frames
}
