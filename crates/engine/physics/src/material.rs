//! Per-voxel material profiles and the per-structure aggregate

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Voxel appearance identifier; `0` is empty space
pub type AppearanceId = u32;

/// Appearance id that marks an empty cell
pub const EMPTY: AppearanceId = 0;

/// Static physical properties of one voxel appearance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialProfile {
    pub density: f32,
    pub friction: f32,
    pub restitution: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    /// Upward acceleration applied to the owning body
    pub levitation_accel: f32,
}

impl MaterialProfile {
    /// Create a profile, clamping density and levitation to `>= 0` and
    /// coefficients to `[0, 1]`
    pub fn new(
        density: f32,
        friction: f32,
        restitution: f32,
        linear_damping: f32,
        angular_damping: f32,
        levitation_accel: f32,
    ) -> Self {
        Self {
            density: density.max(0.0),
            friction: friction.clamp(0.0, 1.0),
            restitution: restitution.clamp(0.0, 1.0),
            linear_damping: linear_damping.clamp(0.0, 1.0),
            angular_damping: angular_damping.clamp(0.0, 1.0),
            levitation_accel: levitation_accel.max(0.0),
        }
    }
}

impl Default for MaterialProfile {
    fn default() -> Self {
        MaterialKind::Default.profile()
    }
}

/// Named material presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialKind {
    Default,
    Stone,
    Metal,
    Wood,
    Glass,
    Ice,
    Slime,
    Soft,
    Light,
    Sand,
    Levitating,
}

impl MaterialKind {
    pub fn profile(self) -> MaterialProfile {
        match self {
            MaterialKind::Default => MaterialProfile::new(1.0, 0.6, 0.0, 0.05, 0.1, 0.0),
            MaterialKind::Stone => MaterialProfile::new(2.0, 0.7, 0.0, 0.05, 0.1, 0.0),
            MaterialKind::Metal => MaterialProfile::new(3.0, 0.4, 0.05, 0.03, 0.08, 0.0),
            MaterialKind::Wood => MaterialProfile::new(0.8, 0.6, 0.02, 0.08, 0.12, 0.0),
            MaterialKind::Glass => MaterialProfile::new(1.2, 0.2, 0.15, 0.06, 0.12, 0.0),
            MaterialKind::Ice => MaterialProfile::new(0.9, 0.05, 0.05, 0.02, 0.05, 0.0),
            MaterialKind::Slime => MaterialProfile::new(1.0, 0.8, 0.8, 0.12, 0.2, 0.0),
            MaterialKind::Soft => MaterialProfile::new(0.4, 0.7, 0.1, 0.2, 0.25, 0.0),
            MaterialKind::Light => MaterialProfile::new(0.2, 0.4, 0.0, 0.25, 0.3, 0.0),
            MaterialKind::Sand => MaterialProfile::new(1.4, 0.55, 0.02, 0.18, 0.22, 0.0),
            MaterialKind::Levitating => MaterialProfile::new(1.5, 0.6, 0.02, 0.05, 0.1, 12.0),
        }
    }
}

/// Appearance → profile lookup
///
/// Resolution is pure, so every appearance is resolved once and served from
/// the cache afterwards.
#[derive(Debug, Default)]
pub struct MaterialTable {
    assignments: HashMap<AppearanceId, MaterialKind>,
    cache: Mutex<HashMap<AppearanceId, MaterialProfile>>,
}

impl MaterialTable {
    pub fn new(assignments: HashMap<AppearanceId, MaterialKind>) -> Self {
        Self {
            assignments,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Assign a preset to an appearance, invalidating any cached resolution
    pub fn assign(&mut self, appearance: AppearanceId, kind: MaterialKind) {
        self.assignments.insert(appearance, kind);
        if let Ok(cache) = self.cache.get_mut() {
            cache.remove(&appearance);
        }
    }

    /// Profile for an appearance; unknown appearances get the default profile
    pub fn profile_for(&self, appearance: AppearanceId) -> MaterialProfile {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cache.entry(appearance).or_insert_with(|| {
            self.assignments
                .get(&appearance)
                .map(|k| k.profile())
                .unwrap_or_default()
        })
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Weighted material summary handed to the bridge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialSummary {
    pub mass: f32,
    pub friction: f32,
    pub restitution: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub levitation_accel: f32,
    pub block_count: u32,
}

impl MaterialSummary {
    /// Mass to hand to a body; never below one unit
    pub fn body_mass(&self) -> f32 {
        self.mass.max(1.0)
    }
}

impl Default for MaterialSummary {
    fn default() -> Self {
        let d = MaterialProfile::default();
        Self {
            mass: 0.0,
            friction: d.friction,
            restitution: d.restitution,
            linear_damping: d.linear_damping,
            angular_damping: d.angular_damping,
            levitation_accel: 0.0,
            block_count: 0,
        }
    }
}

/// Incremental mass-weighted aggregate over a structure's voxels
///
/// Removing a profile is the exact inverse of adding it; every sum is clamped
/// at zero to absorb floating-point drift.
#[derive(Debug, Clone, Default)]
pub struct MaterialAggregator {
    total_mass: f64,
    sum_friction: f64,
    sum_restitution: f64,
    sum_linear_damping: f64,
    sum_angular_damping: f64,
    sum_levitation: f64,
    block_count: u32,
}

impl MaterialAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate every profile in one pass
    pub fn from_profiles<I>(profiles: I) -> Self
    where
        I: IntoIterator<Item = MaterialProfile>,
    {
        let mut agg = Self::new();
        for p in profiles {
            agg.add(&p);
        }
        agg
    }

    pub fn add(&mut self, profile: &MaterialProfile) {
        let mass = profile.density.max(0.0) as f64;
        self.total_mass += mass;
        self.sum_friction += profile.friction as f64 * mass;
        self.sum_restitution += profile.restitution as f64 * mass;
        self.sum_linear_damping += profile.linear_damping as f64 * mass;
        self.sum_angular_damping += profile.angular_damping as f64 * mass;
        self.sum_levitation += profile.levitation_accel.max(0.0) as f64 * mass;
        self.block_count += 1;
    }

    pub fn remove(&mut self, profile: &MaterialProfile) {
        let mass = profile.density.max(0.0) as f64;
        self.total_mass = (self.total_mass - mass).max(0.0);
        self.sum_friction = (self.sum_friction - profile.friction as f64 * mass).max(0.0);
        self.sum_restitution = (self.sum_restitution - profile.restitution as f64 * mass).max(0.0);
        self.sum_linear_damping =
            (self.sum_linear_damping - profile.linear_damping as f64 * mass).max(0.0);
        self.sum_angular_damping =
            (self.sum_angular_damping - profile.angular_damping as f64 * mass).max(0.0);
        self.sum_levitation =
            (self.sum_levitation - profile.levitation_accel.max(0.0) as f64 * mass).max(0.0);
        self.block_count = self.block_count.saturating_sub(1);
    }

    /// Current summary; an empty or massless aggregate reports the default material
    pub fn snapshot(&self) -> MaterialSummary {
        if self.total_mass <= 1e-6 {
            return MaterialSummary {
                block_count: self.block_count,
                ..MaterialSummary::default()
            };
        }
        let m = self.total_mass;
        MaterialSummary {
            mass: m as f32,
            friction: (self.sum_friction / m) as f32,
            restitution: (self.sum_restitution / m) as f32,
            linear_damping: (self.sum_linear_damping / m) as f32,
            angular_damping: (self.sum_angular_damping / m) as f32,
            levitation_accel: (self.sum_levitation / m) as f32,
            block_count: self.block_count,
        }
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }
}
