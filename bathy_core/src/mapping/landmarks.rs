// bathy_core/src/mapping/landmarks.rs

use crate::error::ConfigError;
use crate::types::{Landmark, LandmarkId, LandmarkSet};
use dyn_clone::DynClone;
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkConfig {
    /// Side of the (x, y) grid cells landmarks are extracted from (m).
    pub cell_size: f64,
    /// Minimum height difference to the neighbouring cells (m).
    pub min_salience: f64,
    pub max_per_submap: usize,
    /// Gate for matching a candidate to a known landmark (m).
    pub association_distance: f64,
}

impl Default for LandmarkConfig {
    fn default() -> Self {
        Self {
            cell_size: 4.0,
            min_salience: 0.5,
            max_per_submap: 30,
            association_distance: 3.0,
        }
    }
}

// =========================================================================
// == Extraction ==
// =========================================================================

/// A salient point picked from a merged submap cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkCandidate {
    pub position: Point3<f64>,
    /// Absolute height difference to the mean of the occupied neighbour cells.
    pub salience: f64,
}

/// Picks cell centroids that stand out from their neighbourhood.
#[derive(Debug, Clone)]
pub struct LandmarkExtractor {
    cell_size: f64,
    min_salience: f64,
    max_per_submap: usize,
}

impl LandmarkExtractor {
    pub fn new(config: &LandmarkConfig) -> Result<Self, ConfigError> {
        if !config.cell_size.is_finite() || config.cell_size <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: "cell_size",
                value: config.cell_size,
            });
        }
        if !config.min_salience.is_finite() || config.min_salience < 0.0 {
            return Err(ConfigError::NotPositive {
                name: "min_salience",
                value: config.min_salience,
            });
        }
        Ok(Self {
            cell_size: config.cell_size,
            min_salience: config.min_salience,
            max_per_submap: config.max_per_submap,
        })
    }

    /// Strongest candidates first, at most `max_per_submap` of them.
    pub fn extract(&self, cloud: &[Point3<f64>]) -> Vec<LandmarkCandidate> {
        let mut cells: HashMap<(i64, i64), (Vector3<f64>, usize)> = HashMap::new();
        for p in cloud {
            if !p.coords.iter().all(|c| c.is_finite()) {
                continue;
            }
            let entry = cells
                .entry(self.cell_of(p))
                .or_insert((Vector3::zeros(), 0));
            entry.0 += p.coords;
            entry.1 += 1;
        }
        let centroids: HashMap<(i64, i64), Point3<f64>> = cells
            .into_iter()
            .map(|(key, (sum, count))| (key, Point3::from(sum / count as f64)))
            .collect();

        let mut candidates: Vec<((i64, i64), LandmarkCandidate)> = centroids
            .iter()
            .filter_map(|(&(cx, cy), centroid)| {
                let neighbours: Vec<f64> = NEIGHBOURS
                    .iter()
                    .filter_map(|(dx, dy)| centroids.get(&(cx + dx, cy + dy)))
                    .map(|n| n.z)
                    .collect();
                if neighbours.is_empty() {
                    return None;
                }
                let mean_z = neighbours.iter().sum::<f64>() / neighbours.len() as f64;
                let salience = (centroid.z - mean_z).abs();
                (salience >= self.min_salience).then_some((
                    (cx, cy),
                    LandmarkCandidate {
                        position: *centroid,
                        salience,
                    },
                ))
            })
            .collect();

        // Cell key breaks ties so the output does not depend on hash order.
        candidates.sort_by(|(ka, a), (kb, b)| {
            b.salience.total_cmp(&a.salience).then_with(|| ka.cmp(kb))
        });
        candidates.truncate(self.max_per_submap);
        candidates.into_iter().map(|(_, c)| c).collect()
    }

    fn cell_of(&self, p: &Point3<f64>) -> (i64, i64) {
        (
            (p.x / self.cell_size).floor() as i64,
            (p.y / self.cell_size).floor() as i64,
        )
    }
}

const NEIGHBOURS: [(i64, i64); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

// =========================================================================
// == Data Association ==
// =========================================================================

/// Assigns persistent identities to the candidates of one submap.
///
/// A wrong assignment corrupts the graph for good, since committed factors
/// can not be retracted.
pub trait DataAssociation: DynClone + Debug + Send + Sync {
    /// Each known id is handed out at most once per call.
    fn associate(&mut self, candidates: &[LandmarkCandidate]) -> LandmarkSet;

    /// Replaces known positions with refined estimates, e.g. from the graph.
    fn update_known(&mut self, landmarks: &[Landmark]);

    fn known_count(&self) -> usize;
}

// Make the trait object cloneable.
dyn_clone::clone_trait_object!(DataAssociation);

type GridKey = (i64, i64, i64);

/// Matches each candidate to the closest known landmark inside a gate.
///
/// Known positions are kept by id plus a spatial hash with cells as large as
/// the gate, so only the 27 surrounding cells are searched.
#[derive(Debug, Clone)]
pub struct NearestNeighborAssociation {
    max_distance: f64,
    known: HashMap<LandmarkId, Point3<f64>>,
    grid: HashMap<GridKey, Vec<LandmarkId>>,
    next_id: u64,
}

impl NearestNeighborAssociation {
    pub fn new(max_distance: f64) -> Result<Self, ConfigError> {
        if !max_distance.is_finite() || max_distance <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: "association_distance",
                value: max_distance,
            });
        }
        Ok(Self {
            max_distance,
            known: HashMap::new(),
            grid: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn position(&self, id: LandmarkId) -> Option<&Point3<f64>> {
        self.known.get(&id)
    }

    fn key(&self, p: &Point3<f64>) -> GridKey {
        (
            (p.x / self.max_distance).floor() as i64,
            (p.y / self.max_distance).floor() as i64,
            (p.z / self.max_distance).floor() as i64,
        )
    }

    fn insert(&mut self, id: LandmarkId, position: Point3<f64>) {
        if let Some(old) = self.known.insert(id, position) {
            let old_key = self.key(&old);
            if let Some(bucket) = self.grid.get_mut(&old_key) {
                bucket.retain(|other| *other != id);
            }
        }
        let key = self.key(&position);
        self.grid.entry(key).or_default().push(id);
    }

    /// Known landmarks within the gate of `p`, with their distance.
    fn within_gate(&self, p: &Point3<f64>) -> Vec<(f64, LandmarkId)> {
        let (kx, ky, kz) = self.key(p);
        let mut found = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let Some(bucket) = self.grid.get(&(kx + dx, ky + dy, kz + dz)) else {
                        continue;
                    };
                    for id in bucket {
                        let distance = (self.known[id] - p).norm();
                        if distance <= self.max_distance {
                            found.push((distance, *id));
                        }
                    }
                }
            }
        }
        found
    }
}

impl DataAssociation for NearestNeighborAssociation {
    fn associate(&mut self, candidates: &[LandmarkCandidate]) -> LandmarkSet {
        // Closest pairs are resolved first, greedily.
        let mut pairs: Vec<(f64, usize, LandmarkId)> = candidates
            .iter()
            .enumerate()
            .flat_map(|(i, c)| {
                self.within_gate(&c.position)
                    .into_iter()
                    .map(move |(d, id)| (d, i, id))
            })
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.2.cmp(&b.2)));

        let mut assigned: Vec<Option<LandmarkId>> = vec![None; candidates.len()];
        let mut claimed: HashSet<LandmarkId> = HashSet::new();
        for (_, i, id) in pairs {
            if assigned[i].is_none() && !claimed.contains(&id) {
                assigned[i] = Some(id);
                claimed.insert(id);
            }
        }

        candidates
            .iter()
            .zip(assigned)
            .map(|(c, id)| {
                let id = id.unwrap_or_else(|| {
                    let fresh = LandmarkId(self.next_id);
                    self.next_id += 1;
                    self.insert(fresh, c.position);
                    fresh
                });
                Landmark {
                    id,
                    position: c.position,
                }
            })
            .collect()
    }

    fn update_known(&mut self, landmarks: &[Landmark]) {
        for landmark in landmarks {
            self.insert(landmark.id, landmark.position);
            self.next_id = self.next_id.max(landmark.id.0 + 1);
        }
    }

    fn known_count(&self) -> usize {
        self.known.len()
    }
}
