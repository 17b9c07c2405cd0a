//! Snapshot policy for pushed changes.

use rand::Rng;

/// No snapshot is taken by chance at or below this many changes.
pub const SNAPSHOT_FREE_CHANGES: usize = 100;
const CHANCE_DIVISOR: f64 = 200_000.0;
const MAX_CHANCE: f64 = 0.05;

/// Probability of a random snapshot after `changes_since_snapshot` changes.
///
/// Rises linearly from zero above [`SNAPSHOT_FREE_CHANGES`] until it reaches
/// its cap. The cumulative chance of having snapshotted is close to one after
/// a couple of thousand changes.
pub fn snapshot_probability(changes_since_snapshot: usize) -> f64 {
    if changes_since_snapshot <= SNAPSHOT_FREE_CHANGES {
        return 0.0;
    }
    let over = (changes_since_snapshot - SNAPSHOT_FREE_CHANGES) as f64;
    (over / CHANCE_DIVISOR).min(MAX_CHANCE)
}

pub fn snapshot_chance<R: Rng + ?Sized>(rng: &mut R, changes_since_snapshot: usize) -> bool {
    let p = snapshot_probability(changes_since_snapshot);
    p > 0.0 && rng.gen::<f64>() < p
}

/// Inputs of the snapshot decision for one push.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotDecision {
    pub requested: bool,
    /// The tree holds only its root.
    pub heads_are_root: bool,
    pub content_is_empty: bool,
    pub changes_since_snapshot: usize,
}

impl SnapshotDecision {
    pub fn should_snapshot<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.requested
            || self.heads_are_root
            || self.content_is_empty
            || snapshot_chance(rng, self.changes_since_snapshot)
    }
}
