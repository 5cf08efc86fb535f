//! Composited stream volume
//!
//! Each stream's device gain is the product of independently owned
//! multipliers. Whoever owns a multiplier (script, fade thread,
//! choreographer) only ever touches its own slot.

/// Independently settable volume multipliers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    /// Script-requested volume
    Base = 0,
    /// Driven by the fade-out thread
    FadeOut = 1,
    /// Driven by the fade-in thread
    FadeIn = 2,
    /// Driven by the jingle choreographer
    External = 3,
}

impl VolumeKind {
    pub const ALL: [VolumeKind; 4] = [
        VolumeKind::Base,
        VolumeKind::FadeOut,
        VolumeKind::FadeIn,
        VolumeKind::External,
    ];
}

/// Product of per-kind multipliers, scaled by a global constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeComposite {
    values: [f32; 4],
    global: f32,
}

impl VolumeComposite {
    /// All multipliers at 1.0
    pub fn new(global: f32) -> Self {
        Self {
            values: [1.0; 4],
            global,
        }
    }

    pub fn get(&self, kind: VolumeKind) -> f32 {
        self.values[kind as usize]
    }

    /// Set one multiplier (clamped to 0..=1). Returns the new effective gain.
    pub fn set(&mut self, kind: VolumeKind, value: f32) -> f32 {
        self.values[kind as usize] = value.clamp(0.0, 1.0);
        self.effective()
    }

    /// Global scale times every multiplier
    pub fn effective(&self) -> f32 {
        self.values.iter().product::<f32>() * self.global
    }

    pub fn global(&self) -> f32 {
        self.global
    }
}
