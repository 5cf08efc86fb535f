//! Fade curve implementations for volume ramps
//!
//! Script-requested fade-outs are linear by default; the automatic 1-second
//! fade-in applied when a track resumes from an offset is quadratic.

use serde::{Deserialize, Serialize};

/// Fade curve types
///
/// - Linear: Constant rate of change
/// - Exponential: Slow start, fast finish (quadratic ease-in)
/// - SCurve: Smooth acceleration and deceleration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// Linear: v(t) = t
    Linear,

    /// Exponential: v(t) = t²
    Exponential,

    /// S-Curve: v(t) = 0.5 × (1 - cos(π × t))
    #[serde(alias = "cosine", alias = "scurve")]
    SCurve,
}

impl FadeCurve {
    /// Calculate fade-in multiplier at given position
    ///
    /// # Arguments
    /// * `position` - Normalized position through fade (0.0 to 1.0)
    ///
    /// # Returns
    /// Volume multiplier to apply (0.0 = silence, 1.0 = full volume)
    pub fn calculate_fade_in(&self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);

        match self {
            FadeCurve::Linear => t,
            FadeCurve::Exponential => t * t,
            FadeCurve::SCurve => 0.5 * (1.0 - (std::f32::consts::PI * t).cos()),
        }
    }

    /// Calculate fade-out multiplier at given position
    ///
    /// # Arguments
    /// * `position` - Normalized position through fade (0.0 to 1.0)
    ///
    /// # Returns
    /// Volume multiplier to apply (1.0 at start, 0.0 at end)
    pub fn calculate_fade_out(&self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);

        match self {
            FadeCurve::Linear => 1.0 - t,
            FadeCurve::Exponential => {
                let inv = 1.0 - t;
                inv * inv
            }
            FadeCurve::SCurve => 0.5 * (1.0 + (std::f32::consts::PI * t).cos()),
        }
    }

    /// Get all available fade curve variants
    pub fn all_variants() -> &'static [FadeCurve] {
        &[FadeCurve::Linear, FadeCurve::Exponential, FadeCurve::SCurve]
    }
}

impl std::fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FadeCurve::Linear => "Linear",
            FadeCurve::Exponential => "Exponential",
            FadeCurve::SCurve => "S-Curve",
        };
        write!(f, "{}", name)
    }
}
