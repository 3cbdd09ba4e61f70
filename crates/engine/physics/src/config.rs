use crate::error::{PhysicsError, Result};
use crate::material::{AppearanceId, MaterialKind, MaterialTable};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Tunables for schedulers, simulation and shadow space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    /// Voxels a selection scan visits per tick
    pub selection_voxels_per_tick: u32,
    /// Voxels shared by all ambient chunk scans per tick
    pub ambient_voxels_per_tick: u32,
    /// Largest selection accepted, in voxels
    pub max_selection_volume: u64,
    /// Delay before a dirtied chunk is rebuilt
    pub ambient_rebuild_delay_ticks: u64,
    /// Dirty chunks promoted to builds per tick
    pub ambient_dirty_per_tick: u32,
    /// Chunk collider requests issued for structures per tick
    pub world_collider_budget: u32,
    pub gravity: [f32; 3],
    pub fixed_dt: f32,
    /// Ticks without a hit before mining progress is dropped
    pub mining_timeout_ticks: u64,
    pub interaction_reach: f32,
    pub shipyard: ShipyardConfig,
    /// Appearance id (as string key) to material preset
    pub materials: HashMap<String, MaterialKind>,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            selection_voxels_per_tick: 4096,
            ambient_voxels_per_tick: 8192,
            max_selection_volume: 262_144,
            ambient_rebuild_delay_ticks: 20,
            ambient_dirty_per_tick: 4,
            world_collider_budget: 32,
            gravity: [0.0, -9.81, 0.0],
            fixed_dt: 1.0 / 60.0,
            mining_timeout_ticks: 20,
            interaction_reach: 5.0,
            shipyard: ShipyardConfig::default(),
            materials: HashMap::new(),
        }
    }
}

/// Shadow-space layout
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipyardConfig {
    /// Elevation of every region's minimum corner
    pub base_y: i32,
    /// Empty voxels kept between neighbouring regions
    pub padding: i32,
    /// Row width after which placement wraps to a new row
    pub max_row_width: i32,
    /// Neighbor updates drained per tick
    pub updates_per_tick: usize,
}

impl Default for ShipyardConfig {
    fn default() -> Self {
        Self {
            base_y: 64,
            padding: 4,
            max_row_width: 4096,
            updates_per_tick: 2000,
        }
    }
}

impl PhysicsConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PhysicsConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.selection_voxels_per_tick == 0 || self.ambient_voxels_per_tick == 0 {
            return Err(PhysicsError::Config("scan budgets must be non-zero".into()));
        }
        if self.ambient_dirty_per_tick == 0 {
            return Err(PhysicsError::Config(
                "ambient_dirty_per_tick must be non-zero".into(),
            ));
        }
        if self.max_selection_volume == 0 {
            return Err(PhysicsError::Config(
                "max_selection_volume must be non-zero".into(),
            ));
        }
        if !(self.fixed_dt > 0.0) {
            return Err(PhysicsError::Config("fixed_dt must be positive".into()));
        }
        if !self.interaction_reach.is_finite() || self.interaction_reach <= 0.0 {
            return Err(PhysicsError::Config(
                "interaction_reach must be positive and finite".into(),
            ));
        }
        if self.shipyard.padding < 0 || self.shipyard.max_row_width <= 0 {
            return Err(PhysicsError::Config("invalid shipyard layout".into()));
        }
        if self.shipyard.updates_per_tick == 0 {
            return Err(PhysicsError::Config(
                "shipyard.updates_per_tick must be non-zero".into(),
            ));
        }
        self.material_assignments().map(|_| ())
    }

    pub fn gravity(&self) -> Vec3 {
        Vec3::from_array(self.gravity)
    }

    fn material_assignments(&self) -> Result<HashMap<AppearanceId, MaterialKind>> {
        self.materials
            .iter()
            .map(|(key, kind)| {
                key.parse::<AppearanceId>()
                    .map(|id| (id, *kind))
                    .map_err(|_| PhysicsError::Config(format!("bad appearance id '{}'", key)))
            })
            .collect()
    }

    /// Material table built from the `materials` map
    pub fn material_table(&self) -> Result<MaterialTable> {
        Ok(MaterialTable::new(self.material_assignments()?))
    }
}
