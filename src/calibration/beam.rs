//! Primary beam current used to normalise intensities.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where the normalising current comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BeamCurrentMode {
    /// The frame's own reading.
    #[default]
    Raw,
    /// Mean of the last `window` readings, this frame included.
    Smoothed { window: usize },
    /// A constant, ignoring the readings.
    Fixed { value: f64 },
}

/// Raw readings of the most recent emitted frames, as many as the smoothing
/// window needs.
#[derive(Debug, Clone, Default)]
pub struct BeamCurrentTracker {
    mode: BeamCurrentMode,
    history: VecDeque<f64>,
}

impl BeamCurrentTracker {
    pub fn new(mode: BeamCurrentMode) -> Self {
        let keep = Self::retained(&mode);
        Self {
            mode,
            history: VecDeque::with_capacity(keep),
        }
    }

    /// Past readings the mode reads: `window - 1` when smoothing, none otherwise.
    fn retained(mode: &BeamCurrentMode) -> usize {
        match mode {
            BeamCurrentMode::Smoothed { window } => window.saturating_sub(1),
            BeamCurrentMode::Raw | BeamCurrentMode::Fixed { .. } => 0,
        }
    }

    pub fn mode(&self) -> &BeamCurrentMode {
        &self.mode
    }

    /// Retained raw readings, oldest first.
    pub fn history(&self) -> &VecDeque<f64> {
        &self.history
    }

    /// Current to normalise a frame with raw reading `raw`. Does not record
    /// the reading; repeated frames call this again with the same value.
    ///
    /// Falls back to 1.0 when the result is not a positive finite number.
    pub fn current_for(&self, raw: f64) -> f64 {
        let used = match self.mode {
            BeamCurrentMode::Raw => raw,
            BeamCurrentMode::Fixed { value } => value,
            BeamCurrentMode::Smoothed { .. } => {
                let sum: f64 = self.history.iter().sum();
                (sum + raw) / (self.history.len() + 1) as f64
            }
        };
        if used.is_finite() && used > 0.0 {
            used
        } else {
            warn!("Beam current {used} unusable (raw {raw}), normalising with 1.0");
            1.0
        }
    }

    /// Record the reading of an emitted frame.
    pub fn commit(&mut self, raw: f64) {
        let keep = Self::retained(&self.mode);
        if keep == 0 {
            return;
        }
        if self.history.len() == keep {
            self.history.pop_front();
        }
        self.history.push_back(raw);
    }
}
