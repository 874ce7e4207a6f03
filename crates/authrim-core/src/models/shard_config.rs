//! Shard configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardGeneration {
    pub generation: u32,
    pub shard_count: u32,
    pub deprecated_at: Option<DateTime<Utc>>,
}

/// Drives routing for newly created refresh families only. Artifacts issued
/// under earlier generations keep routing by their embedded
/// `(generation, shard)` until they expire, so old generations are retained
/// here rather than rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub current_generation: u32,
    pub current_shard_count: u32,
    pub previous_generations: Vec<ShardGeneration>,
}

impl ShardConfig {
    pub fn initial(shard_count: u32) -> Self {
        Self {
            current_generation: 1,
            current_shard_count: shard_count,
            previous_generations: Vec::new(),
        }
    }

    /// Every generation still potentially owning live artifacts.
    pub fn known_generations(&self) -> Vec<(u32, u32)> {
        let mut generations: Vec<(u32, u32)> = self
            .previous_generations
            .iter()
            .map(|g| (g.generation, g.shard_count))
            .collect();
        generations.push((self.current_generation, self.current_shard_count));
        generations
    }
}
