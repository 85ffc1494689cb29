// bathy_core/src/estimation/resampling.rs

use crate::types::ParticleId;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How surviving particles are drawn from the weighted ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    /// One uniform offset, `N` evenly spaced pointers.
    #[default]
    Systematic,
    /// Deterministic `floor(N·w)` copies, remainder drawn systematically.
    Residual,
    /// One uniform draw inside each of the `N` strata.
    Stratified,
    /// `N` independent draws.
    Multinomial,
}

impl ResamplingStrategy {
    /// Draws `weights.len()` source indices. `weights` must be normalized.
    pub fn indices<R: Rng + ?Sized>(&self, weights: &[f64], rng: &mut R) -> Vec<usize> {
        let n = weights.len();
        if n == 0 {
            return Vec::new();
        }
        match self {
            Self::Systematic => {
                let offset: f64 = rng.gen();
                let pointers: Vec<f64> = (0..n).map(|i| (i as f64 + offset) / n as f64).collect();
                walk_cumulative(weights, &pointers)
            }
            Self::Stratified => {
                let pointers: Vec<f64> = (0..n)
                    .map(|i| (i as f64 + rng.gen::<f64>()) / n as f64)
                    .collect();
                walk_cumulative(weights, &pointers)
            }
            Self::Multinomial => {
                let cumulative = cumulative_sum(weights);
                (0..n)
                    .map(|_| {
                        let u: f64 = rng.gen();
                        cumulative.partition_point(|&c| c <= u).min(n - 1)
                    })
                    .collect()
            }
            Self::Residual => residual_indices(weights, rng),
        }
    }
}

fn cumulative_sum(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect()
}

/// `pointers` must be sorted ascending in `[0, 1)`.
fn walk_cumulative(weights: &[f64], pointers: &[f64]) -> Vec<usize> {
    let n = weights.len();
    let mut indices = Vec::with_capacity(pointers.len());
    let mut j = 0;
    let mut cumsum = weights[0];
    for &u in pointers {
        // Rounding can leave the sum a hair below 1, hence the bound on `j`.
        while (u > cumsum || weights[j] == 0.0) && j < n - 1 {
            j += 1;
            cumsum += weights[j];
        }
        indices.push(j);
    }
    indices
}

fn residual_indices<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    let mut indices = Vec::with_capacity(n);
    let mut residual = vec![0.0; n];
    for (i, &w) in weights.iter().enumerate() {
        let scaled = w * n as f64;
        let copies = scaled.floor() as usize;
        indices.extend(std::iter::repeat(i).take(copies));
        residual[i] = scaled - copies as f64;
    }
    indices.truncate(n);

    let remaining = n - indices.len();
    if remaining > 0 {
        let total: f64 = residual.iter().sum();
        if total > 0.0 {
            for r in &mut residual {
                *r /= total;
            }
            let offset: f64 = rng.gen();
            let pointers: Vec<f64> = (0..remaining)
                .map(|i| (i as f64 + offset) / remaining as f64)
                .collect();
            indices.extend(walk_cumulative(&residual, &pointers));
        } else {
            indices.extend(std::iter::repeat(0).take(remaining));
        }
    }
    indices
}

// =========================================================================
// == Particle Lineage ==
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LineageNode {
    /// Weak back-reference, only used for ancestry queries.
    pub parent: Option<ParticleId>,
    pub children: Vec<ParticleId>,
    /// Filter step at which the particle was created.
    pub born_at: u64,
}

/// Every particle that ever existed, indexed by its id.
#[derive(Debug, Clone, Default)]
pub struct LineageArena {
    nodes: Vec<LineageNode>,
}

impl LineageArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new particle and returns its id.
    pub fn spawn(&mut self, parent: Option<ParticleId>, born_at: u64) -> ParticleId {
        let id = ParticleId(self.nodes.len() as u64);
        if let Some(node) = parent.and_then(|p| self.nodes.get_mut(p.0 as usize)) {
            node.children.push(id);
        }
        self.nodes.push(LineageNode {
            parent,
            children: Vec::new(),
            born_at,
        });
        id
    }

    pub fn get(&self, id: ParticleId) -> Option<&LineageNode> {
        self.nodes.get(id.0 as usize)
    }

    pub fn parent(&self, id: ParticleId) -> Option<ParticleId> {
        self.get(id).and_then(|node| node.parent)
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: ParticleId) -> Vec<ParticleId> {
        let mut chain = Vec::new();
        let mut current = self.parent(id);
        while let Some(ancestor) = current {
            chain.push(ancestor);
            current = self.parent(ancestor);
        }
        chain
    }

    /// The nearest particle both `a` and `b` descend from, themselves included.
    pub fn common_ancestor(&self, a: ParticleId, b: ParticleId) -> Option<ParticleId> {
        let mut line_a = vec![a];
        line_a.extend(self.ancestors(a));
        std::iter::once(b)
            .chain(self.ancestors(b))
            .find(|candidate| line_a.contains(candidate))
    }

    /// The root particle `id` descends from.
    pub fn root(&self, id: ParticleId) -> ParticleId {
        self.ancestors(id).last().copied().unwrap_or(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const ALL: [ResamplingStrategy; 4] = [
        ResamplingStrategy::Systematic,
        ResamplingStrategy::Residual,
        ResamplingStrategy::Stratified,
        ResamplingStrategy::Multinomial,
    ];

    #[test]
    fn test_indices_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let weights = [0.1, 0.05, 0.4, 0.15, 0.3];
        for strategy in ALL {
            let indices = strategy.indices(&weights, &mut rng);
            assert_eq!(indices.len(), weights.len(), "{:?}", strategy);
            assert!(indices.iter().all(|&i| i < weights.len()));
        }
    }

    #[test]
    fn test_degenerate_weights_pick_single_particle() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let weights = [0.0, 0.0, 1.0, 0.0];
        for strategy in ALL {
            assert_eq!(strategy.indices(&weights, &mut rng), vec![2; 4], "{:?}", strategy);
        }
    }

    #[test]
    fn test_systematic_uniform_weights_keep_everyone() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let weights = [0.25; 4];
        assert_eq!(
            ResamplingStrategy::Systematic.indices(&weights, &mut rng),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn test_residual_exact_copies() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let weights = [0.5, 0.25, 0.25, 0.0];
        assert_eq!(
            ResamplingStrategy::Residual.indices(&weights, &mut rng),
            vec![0, 0, 1, 2]
        );
    }

    #[test]
    fn test_systematic_copy_counts_bounded() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let weights = [0.12, 0.33, 0.05, 0.2, 0.3];
        let n = weights.len() as f64;
        for _ in 0..50 {
            let indices = ResamplingStrategy::Systematic.indices(&weights, &mut rng);
            for (i, w) in weights.iter().enumerate() {
                let copies = indices.iter().filter(|&&j| j == i).count() as f64;
                assert!(copies >= (w * n).floor() && copies <= (w * n).ceil());
            }
        }
    }

    #[test]
    fn test_lineage_ancestry() {
        let mut arena = LineageArena::new();
        let root_a = arena.spawn(None, 0);
        let root_b = arena.spawn(None, 0);
        let child = arena.spawn(Some(root_a), 1);
        let grandchild = arena.spawn(Some(child), 2);
        let cousin = arena.spawn(Some(root_a), 1);

        assert_eq!(arena.len(), 5);
        assert_eq!(arena.ancestors(grandchild), vec![child, root_a]);
        assert_eq!(arena.root(grandchild), root_a);
        assert_eq!(arena.root(root_b), root_b);
        assert_eq!(arena.common_ancestor(grandchild, cousin), Some(root_a));
        assert_eq!(arena.common_ancestor(grandchild, child), Some(child));
        assert_eq!(arena.common_ancestor(grandchild, root_b), None);
        assert_eq!(arena.get(root_a).unwrap().children, vec![child, cousin]);
        assert_eq!(arena.get(grandchild).unwrap().born_at, 2);
    }
}
