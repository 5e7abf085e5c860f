//! Motion-area to occupancy-event policies
//!
//! The detector only measures how much of the frame differs from the
//! background. Turning that signal into enter/exit counts is the job of an
//! `EventPolicy`, kept separate so it can be swapped and tested on its own.

use crate::domain::types::OccupancyDelta;
use crate::infra::config::{Axis, EventsConfig, Inbound};
use crate::services::detector::MotionMask;
use tracing::debug;

/// Maps a stream of motion masks into occupancy changes
pub trait EventPolicy: Send {
    /// Inspect one analysed mask; returns a delta when an event completes
    fn on_mask(&mut self, mask: &MotionMask) -> Option<OccupancyDelta>;

    /// Drop any in-progress state (e.g. after recalibration)
    fn reset(&mut self);
}

/// An active run of motion frames
#[derive(Debug, Clone, Copy)]
struct Episode {
    start: (f64, f64),
    last: (f64, f64),
    frames: u32,
}

/// Hysteresis on mask area plus centroid travel direction
///
/// An episode opens when the area reaches `activate_area` and closes once it
/// falls to `release_area` or below. When it closes, the centroid travel
/// between the first and last active frames along `axis` decides the event:
/// travel of at least `min_travel` in the inbound direction is an entry, in
/// the opposite direction an exit. Shorter travel yields nothing.
#[derive(Debug)]
pub struct AreaEpisodePolicy {
    activate_area: usize,
    release_area: usize,
    axis: Axis,
    inbound: Inbound,
    min_travel: f64,
    episode: Option<Episode>,
}

impl AreaEpisodePolicy {
    pub fn from_config(events: &EventsConfig) -> Self {
        Self {
            activate_area: events.activate_area,
            release_area: events.release_area,
            axis: events.axis,
            inbound: events.inbound,
            min_travel: events.min_travel,
            episode: None,
        }
    }

    pub fn in_episode(&self) -> bool {
        self.episode.is_some()
    }

    fn travel(&self, episode: &Episode) -> f64 {
        let along = match self.axis {
            Axis::Horizontal => episode.last.0 - episode.start.0,
            Axis::Vertical => episode.last.1 - episode.start.1,
        };
        match self.inbound {
            Inbound::Positive => along,
            Inbound::Negative => -along,
        }
    }

    fn close(&mut self, seq: u64) -> Option<OccupancyDelta> {
        let episode = self.episode.take()?;
        let travel = self.travel(&episode);

        let delta = if travel >= self.min_travel {
            Some(OccupancyDelta::ENTER)
        } else if travel <= -self.min_travel {
            Some(OccupancyDelta::EXIT)
        } else {
            None
        };

        let outcome = match delta {
            Some(d) if d == OccupancyDelta::ENTER => "enter",
            Some(_) => "exit",
            None => "ambiguous",
        };
        debug!(
            seq = %seq,
            frames = %episode.frames,
            travel = %format!("{travel:.1}"),
            outcome = %outcome,
            "motion_episode_closed"
        );
        delta
    }
}

impl EventPolicy for AreaEpisodePolicy {
    fn on_mask(&mut self, mask: &MotionMask) -> Option<OccupancyDelta> {
        let Some(episode) = self.episode.as_mut() else {
            if mask.area >= self.activate_area {
                let centroid = mask.centroid()?;
                self.episode = Some(Episode { start: centroid, last: centroid, frames: 1 });
                debug!(seq = %mask.seq, area = %mask.area, "motion_episode_opened");
            }
            return None;
        };

        if mask.area <= self.release_area {
            return self.close(mask.seq);
        }

        if let Some(centroid) = mask.centroid() {
            episode.last = centroid;
        }
        episode.frames += 1;
        None
    }

    fn reset(&mut self) {
        self.episode = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 100x10 mask with a filled block of columns [x, x + width)
    fn mask_with_block(seq: u64, x: usize, width: usize) -> MotionMask {
        let (w, h) = (100usize, 10usize);
        let mut pixels = vec![0u8; w * h];
        for row in 0..h {
            for col in x..(x + width).min(w) {
                pixels[row * w + col] = 255;
            }
        }
        let area = pixels.iter().filter(|&&p| p != 0).count();
        MotionMask { width: w as u32, height: h as u32, seq, pixels, area }
    }

    fn policy(axis: Axis, inbound: Inbound) -> AreaEpisodePolicy {
        AreaEpisodePolicy::from_config(&EventsConfig {
            activate_area: 50,
            release_area: 5,
            axis,
            inbound,
            min_travel: 20.0,
        })
    }

    fn run(policy: &mut AreaEpisodePolicy, masks: &[MotionMask]) -> Vec<OccupancyDelta> {
        masks.iter().filter_map(|m| policy.on_mask(m)).collect()
    }

    #[test]
    fn test_positive_travel_is_entry() {
        let mut p = policy(Axis::Horizontal, Inbound::Positive);
        let masks = [
            mask_with_block(1, 0, 10),
            mask_with_block(2, 30, 10),
            mask_with_block(3, 60, 10),
            mask_with_block(4, 0, 0),
        ];
        assert_eq!(run(&mut p, &masks), vec![OccupancyDelta::ENTER]);
        assert!(!p.in_episode());
    }

    #[test]
    fn test_negative_inbound_flips_direction() {
        let mut p = policy(Axis::Horizontal, Inbound::Negative);
        let masks = [mask_with_block(1, 0, 10), mask_with_block(2, 60, 10), mask_with_block(3, 0, 0)];
        assert_eq!(run(&mut p, &masks), vec![OccupancyDelta::EXIT]);
    }

    #[test]
    fn test_short_travel_is_ambiguous() {
        let mut p = policy(Axis::Horizontal, Inbound::Positive);
        let masks = [mask_with_block(1, 40, 10), mask_with_block(2, 45, 10), mask_with_block(3, 0, 0)];
        assert!(run(&mut p, &masks).is_empty());
    }

    #[test]
    fn test_vertical_axis_ignores_horizontal_travel() {
        let mut p = policy(Axis::Vertical, Inbound::Positive);
        let masks = [mask_with_block(1, 0, 10), mask_with_block(2, 60, 10), mask_with_block(3, 0, 0)];
        assert!(run(&mut p, &masks).is_empty());
    }

    #[test]
    fn test_area_between_thresholds_keeps_episode_open() {
        let mut p = policy(Axis::Horizontal, Inbound::Positive);
        assert_eq!(p.on_mask(&mask_with_block(1, 0, 10)), None);
        assert!(p.in_episode());
        // 2 columns * 10 rows = 20 px: above release, below activate
        assert_eq!(p.on_mask(&mask_with_block(2, 50, 2)), None);
        assert!(p.in_episode());
        assert_eq!(p.on_mask(&mask_with_block(3, 0, 0)), Some(OccupancyDelta::ENTER));
    }

    #[test]
    fn test_small_motion_never_opens_episode() {
        let mut p = policy(Axis::Horizontal, Inbound::Positive);
        let masks = [mask_with_block(1, 0, 4), mask_with_block(2, 80, 4), mask_with_block(3, 0, 0)];
        assert!(run(&mut p, &masks).is_empty());
        assert!(!p.in_episode());
    }

    #[test]
    fn test_reset_discards_episode() {
        let mut p = policy(Axis::Horizontal, Inbound::Positive);
        p.on_mask(&mask_with_block(1, 0, 10));
        p.reset();
        assert_eq!(p.on_mask(&mask_with_block(2, 0, 0)), None);
    }
}
