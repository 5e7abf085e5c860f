//! Frame-difference motion detector
//!
//! Each frame is converted to grayscale and differenced against a reference
//! frame. The absolute difference is thresholded into a binary mask and
//! dilated with a 3x3 square element to merge nearby blobs and suppress
//! speckle. The mask's active-pixel area is handed to an `EventPolicy`,
//! which decides whether an enter/exit occurred.
//!
//! The very first frame of a session only calibrates the reference; it is
//! never analysed. With the default `FixedBackground` the reference is never
//! advanced afterwards.

use crate::domain::frame::{ColorFrame, MotionFrame};
use crate::domain::types::OccupancyDelta;
use crate::infra::config::{BackgroundKind, Config};
use crate::services::events::{AreaEpisodePolicy, EventPolicy};
use tracing::{debug, info, warn};

/// Mask value for an active pixel
pub const MASK_ON: u8 = 255;

/// Binary motion mask produced for every analysed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionMask {
    pub width: u32,
    pub height: u32,
    pub seq: u64,
    /// 0 or `MASK_ON` per pixel
    pub pixels: Vec<u8>,
    /// Number of active pixels
    pub area: usize,
}

impl MotionMask {
    fn from_pixels(width: u32, height: u32, seq: u64, pixels: Vec<u8>) -> Self {
        let area = pixels.iter().filter(|&&p| p != 0).count();
        Self { width, height, seq, pixels, area }
    }

    /// Mean (x, y) of active pixels, None for an empty mask
    pub fn centroid(&self) -> Option<(f64, f64)> {
        if self.area == 0 {
            return None;
        }
        let w = self.width as usize;
        let (mut sx, mut sy) = (0u64, 0u64);
        for (i, _) in self.pixels.iter().enumerate().filter(|(_, &p)| p != 0) {
            sx += (i % w) as u64;
            sy += (i / w) as u64;
        }
        let n = self.area as f64;
        Some((sx as f64 / n, sy as f64 / n))
    }

    /// Render as BGR24 for display
    pub fn to_bgr(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|&v| [v, v, v]).collect()
    }
}

/// Absolute difference thresholded to a binary mask
pub fn threshold_diff(reference: &MotionFrame, frame: &MotionFrame, threshold: u8) -> Vec<u8> {
    reference
        .pixels
        .iter()
        .zip(&frame.pixels)
        .map(|(&a, &b)| if a.abs_diff(b) > threshold { MASK_ON } else { 0 })
        .collect()
}

/// Dilate with a 3x3 square element, `iterations` times
///
/// Neighbours outside the image are ignored. The square element is
/// separable, so each pass is a horizontal max followed by a vertical max.
pub fn dilate(mask: &[u8], width: usize, height: usize, iterations: u32) -> Vec<u8> {
    let mut current = mask.to_vec();
    if width == 0 || height == 0 {
        return current;
    }
    let mut scratch = vec![0u8; current.len()];

    for _ in 0..iterations {
        for y in 0..height {
            let row = &current[y * width..(y + 1) * width];
            let out = &mut scratch[y * width..(y + 1) * width];
            for x in 0..width {
                let lo = x.saturating_sub(1);
                let hi = (x + 1).min(width - 1);
                out[x] = row[lo..=hi].iter().copied().max().unwrap_or(0);
            }
        }
        for y in 0..height {
            let up = y.saturating_sub(1);
            let down = (y + 1).min(height - 1);
            for x in 0..width {
                let mut v = scratch[up * width + x];
                for yy in up + 1..=down {
                    v = v.max(scratch[yy * width + x]);
                }
                current[y * width + x] = v;
            }
        }
    }

    current
}

/// Source of the reference frame motion is measured against
pub trait BackgroundModel: Send {
    /// Current reference, None until calibrated
    fn reference(&self) -> Option<&MotionFrame>;

    /// Install a new reference, discarding any history
    fn calibrate(&mut self, frame: MotionFrame);

    /// Called with every analysed frame after differencing
    fn absorb(&mut self, frame: &MotionFrame);

    fn name(&self) -> &'static str;
}

/// Background captured once at session start and never updated
#[derive(Debug, Default)]
pub struct FixedBackground {
    reference: Option<MotionFrame>,
}

impl BackgroundModel for FixedBackground {
    fn reference(&self) -> Option<&MotionFrame> {
        self.reference.as_ref()
    }

    fn calibrate(&mut self, frame: MotionFrame) {
        self.reference = Some(frame);
    }

    fn absorb(&mut self, _frame: &MotionFrame) {}

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Exponential moving average of frame history
///
/// `reference = round(acc)`, `acc = acc * (1 - alpha) + frame * alpha`.
#[derive(Debug)]
pub struct RunningAverageBackground {
    alpha: f32,
    accumulator: Vec<f32>,
    reference: Option<MotionFrame>,
}

impl RunningAverageBackground {
    pub fn new(alpha: f32) -> Self {
        Self { alpha: alpha.clamp(f32::EPSILON, 1.0), accumulator: Vec::new(), reference: None }
    }
}

impl BackgroundModel for RunningAverageBackground {
    fn reference(&self) -> Option<&MotionFrame> {
        self.reference.as_ref()
    }

    fn calibrate(&mut self, frame: MotionFrame) {
        self.accumulator = frame.pixels.iter().map(|&p| f32::from(p)).collect();
        self.reference = Some(frame);
    }

    fn absorb(&mut self, frame: &MotionFrame) {
        let Some(reference) = self.reference.as_mut() else {
            return;
        };
        if !reference.same_dimensions(frame) {
            return;
        }
        let alpha = self.alpha;
        for ((acc, out), &px) in
            self.accumulator.iter_mut().zip(reference.pixels.iter_mut()).zip(&frame.pixels)
        {
            *acc = *acc * (1.0 - alpha) + f32::from(px) * alpha;
            *out = acc.round().clamp(0.0, 255.0) as u8;
        }
        reference.seq = frame.seq;
    }

    fn name(&self) -> &'static str {
        "running_average"
    }
}

/// Build the background model selected in config
pub fn background_from_config(config: &Config) -> Box<dyn BackgroundModel> {
    match config.detector_background() {
        BackgroundKind::Fixed => Box::new(FixedBackground::default()),
        BackgroundKind::RunningAverage => {
            Box::new(RunningAverageBackground::new(config.detector_alpha()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorSettings {
    pub threshold: u8,
    pub dilate_iterations: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self { threshold: 25, dilate_iterations: 2 }
    }
}

/// Motion detector scoped to one camera session
pub struct FrameDiffDetector {
    settings: DetectorSettings,
    background: Box<dyn BackgroundModel>,
    policy: Box<dyn EventPolicy>,
    last_mask: Option<MotionMask>,
    frames_analysed: u64,
}

impl FrameDiffDetector {
    pub fn new(
        settings: DetectorSettings,
        background: Box<dyn BackgroundModel>,
        policy: Box<dyn EventPolicy>,
    ) -> Self {
        Self { settings, background, policy, last_mask: None, frames_analysed: 0 }
    }

    pub fn from_config(config: &Config) -> Self {
        let settings = DetectorSettings {
            threshold: config.detector_threshold(),
            dilate_iterations: config.detector_dilate_iterations(),
        };
        let detector = Self::new(
            settings,
            background_from_config(config),
            Box::new(AreaEpisodePolicy::from_config(config.events())),
        );
        info!(
            threshold = %settings.threshold,
            dilate_iterations = %settings.dilate_iterations,
            background = %detector.background.name(),
            "detector_configured"
        );
        detector
    }

    /// Feed one frame; returns the occupancy change it completes, if any
    pub fn observe(&mut self, frame: &ColorFrame) -> Option<OccupancyDelta> {
        let gray = frame.to_gray();

        let Some(reference) = self.background.reference() else {
            debug!(seq = %gray.seq, width = %gray.width, height = %gray.height, "detector_calibrated");
            self.background.calibrate(gray);
            return None;
        };

        if !reference.same_dimensions(&gray) {
            warn!(
                seq = %gray.seq,
                old_width = %reference.width,
                old_height = %reference.height,
                width = %gray.width,
                height = %gray.height,
                "detector_resolution_changed"
            );
            self.background.calibrate(gray);
            self.policy.reset();
            self.last_mask = None;
            return None;
        }

        let thresholded = threshold_diff(reference, &gray, self.settings.threshold);
        let dilated = dilate(
            &thresholded,
            gray.width as usize,
            gray.height as usize,
            self.settings.dilate_iterations,
        );
        let mask = MotionMask::from_pixels(gray.width, gray.height, gray.seq, dilated);
        self.background.absorb(&gray);
        self.frames_analysed += 1;

        tracing::trace!(seq = %mask.seq, area = %mask.area, "motion_mask");

        let delta = self.policy.on_mask(&mask);
        self.last_mask = Some(mask);
        delta.filter(|d| !d.is_zero())
    }

    /// Mask computed for the most recent analysed frame
    pub fn last_mask(&self) -> Option<&MotionMask> {
        self.last_mask.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.background.reference().is_some()
    }

    pub fn frames_analysed(&self) -> u64 {
        self.frames_analysed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::frame::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
    use crate::infra::config::{Axis, EventsConfig, Inbound};

    /// Gray background with a white square at (x, y)
    fn frame_with_square(seq: u64, x: u32, y: u32, side: u32) -> ColorFrame {
        let (w, h) = (64u32, 48u32);
        let mut frame = ColorFrame::filled(w, h, seq, [40, 40, 40]);
        let data = frame.as_bytes_mut();
        for yy in y..(y + side).min(h) {
            for xx in x..(x + side).min(w) {
                let i = ((yy * w + xx) * 3) as usize;
                data[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        frame
    }

    fn small_detector() -> FrameDiffDetector {
        let events = EventsConfig {
            activate_area: 100,
            release_area: 10,
            axis: Axis::Horizontal,
            inbound: Inbound::Positive,
            min_travel: 10.0,
        };
        FrameDiffDetector::new(
            DetectorSettings::default(),
            Box::new(FixedBackground::default()),
            Box::new(AreaEpisodePolicy::from_config(&events)),
        )
    }

    #[test]
    fn test_first_frame_is_calibration_only() {
        let mut detector = small_detector();
        assert!(!detector.is_calibrated());
        assert_eq!(detector.observe(&frame_with_square(0, 10, 10, 20)), None);
        assert!(detector.is_calibrated());
        assert!(detector.last_mask().is_none());
        assert_eq!(detector.frames_analysed(), 0);
    }

    #[test]
    fn test_identical_full_size_frames_produce_no_motion() {
        let mut detector = FrameDiffDetector::from_config(&Config::default());
        let frame = ColorFrame::filled(DEFAULT_WIDTH, DEFAULT_HEIGHT, 0, [90, 120, 30]);
        assert_eq!(detector.observe(&frame), None);
        assert_eq!(detector.observe(&frame), None);
        assert_eq!(detector.last_mask().map(|m| m.area), Some(0));
    }

    #[test]
    fn test_threshold_is_strictly_greater() {
        let reference = MotionFrame::new(3, 1, 0, vec![100, 100, 100]).unwrap();
        let frame = MotionFrame::new(3, 1, 1, vec![125, 126, 74]).unwrap();
        assert_eq!(threshold_diff(&reference, &frame, 25), vec![0, MASK_ON, MASK_ON]);
    }

    #[test]
    fn test_dilate_single_pixel_two_iterations_makes_5x5() {
        let (w, h) = (9usize, 9usize);
        let mut mask = vec![0u8; w * h];
        mask[4 * w + 4] = MASK_ON;
        let out = dilate(&mask, w, h, 2);
        assert_eq!(out.iter().filter(|&&p| p != 0).count(), 25);
        assert_eq!(out[2 * w + 2], MASK_ON);
        assert_eq!(out[6 * w + 6], MASK_ON);
        assert_eq!(out[w + 1], 0);
    }

    #[test]
    fn test_dilate_clips_at_border() {
        let (w, h) = (5usize, 5usize);
        let mut mask = vec![0u8; w * h];
        mask[0] = MASK_ON;
        let out = dilate(&mask, w, h, 1);
        assert_eq!(out.iter().filter(|&&p| p != 0).count(), 4);
    }

    #[test]
    fn test_mask_area_and_centroid() {
        let mut detector = small_detector();
        detector.observe(&frame_with_square(0, 0, 0, 0));
        detector.observe(&frame_with_square(1, 20, 20, 4));
        let mask = detector.last_mask().unwrap();
        // 4x4 square dilated twice becomes 8x8
        assert_eq!(mask.area, 64);
        let (cx, cy) = mask.centroid().unwrap();
        assert!((cx - 21.5).abs() < 1e-9);
        assert!((cy - 21.5).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_reference_is_not_advanced() {
        let mut detector = small_detector();
        detector.observe(&frame_with_square(0, 0, 0, 0));
        let moved = frame_with_square(1, 30, 10, 10);
        detector.observe(&moved);
        let first_area = detector.last_mask().unwrap().area;
        detector.observe(&moved);
        assert_eq!(detector.last_mask().unwrap().area, first_area);
        assert!(first_area > 0);
    }

    #[test]
    fn test_running_average_absorbs_static_change() {
        let mut detector = FrameDiffDetector::new(
            DetectorSettings::default(),
            Box::new(RunningAverageBackground::new(1.0)),
            Box::new(AreaEpisodePolicy::from_config(&EventsConfig::default())),
        );
        detector.observe(&frame_with_square(0, 0, 0, 0));
        let moved = frame_with_square(1, 30, 10, 10);
        detector.observe(&moved);
        assert!(detector.last_mask().unwrap().area > 0);
        detector.observe(&moved);
        assert_eq!(detector.last_mask().unwrap().area, 0);
    }

    #[test]
    fn test_vehicle_crossing_left_to_right_is_an_entry() {
        let mut detector = small_detector();
        detector.observe(&frame_with_square(0, 0, 0, 0));

        let mut deltas = Vec::new();
        for (seq, x) in [2u32, 12, 22, 32, 42].iter().enumerate() {
            deltas.extend(detector.observe(&frame_with_square(seq as u64 + 1, *x, 14, 12)));
        }
        // Vehicle leaves the view
        deltas.extend(detector.observe(&frame_with_square(6, 0, 0, 0)));
        assert_eq!(deltas, vec![OccupancyDelta::ENTER]);
    }

    #[test]
    fn test_vehicle_crossing_right_to_left_is_an_exit() {
        let mut detector = small_detector();
        detector.observe(&frame_with_square(0, 0, 0, 0));

        let mut deltas = Vec::new();
        for (seq, x) in [42u32, 32, 22, 12, 2].iter().enumerate() {
            deltas.extend(detector.observe(&frame_with_square(seq as u64 + 1, *x, 14, 12)));
        }
        deltas.extend(detector.observe(&frame_with_square(6, 0, 0, 0)));
        assert_eq!(deltas, vec![OccupancyDelta::EXIT]);
    }

    #[test]
    fn test_resolution_change_recalibrates() {
        let mut detector = small_detector();
        detector.observe(&frame_with_square(0, 0, 0, 0));
        let bigger = ColorFrame::filled(80, 60, 1, [255, 255, 255]);
        assert_eq!(detector.observe(&bigger), None);
        assert!(detector.last_mask().is_none());
        assert_eq!(detector.observe(&bigger), None);
        assert_eq!(detector.last_mask().unwrap().area, 0);
    }
}
