// bathy_sim/src/simulation/transforms.rs

use bathy_core::types::{FrameHandle, TfProvider};
use nalgebra::Isometry3;
use std::collections::HashMap;

pub const MAP_FRAME: FrameHandle = FrameHandle(0);
pub const ODOM_FRAME: FrameHandle = FrameHandle(1);
pub const BASE_FRAME: FrameHandle = FrameHandle(2);
pub const MBES_FRAME: FrameHandle = FrameHandle(3);

/// A tree of fixed transforms, each frame stored against its parent.
#[derive(Debug, Clone, Default)]
pub struct StaticTfTree {
    /// `child -> (parent, T_parent_child)`.
    parents: HashMap<FrameHandle, (FrameHandle, Isometry3<f64>)>,
}

impl StaticTfTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `child` below `parent`, replacing any previous parent.
    pub fn insert(&mut self, parent: FrameHandle, child: FrameHandle, parent_from_child: Isometry3<f64>) {
        self.parents.insert(child, (parent, parent_from_child));
    }

    /// Walks up to the root, returning it with `T_root_frame`.
    fn to_root(&self, frame: FrameHandle) -> (FrameHandle, Isometry3<f64>) {
        let mut current = frame;
        let mut root_from_frame = Isometry3::identity();
        // Bounded walk: a cycle can't hang the lookup.
        for _ in 0..=self.parents.len() {
            match self.parents.get(&current) {
                Some((parent, parent_from_current)) => {
                    root_from_frame = parent_from_current * root_from_frame;
                    current = *parent;
                }
                None => break,
            }
        }
        (current, root_from_frame)
    }
}

impl TfProvider for StaticTfTree {
    fn get_transform(&self, from: FrameHandle, to: FrameHandle) -> Option<Isometry3<f64>> {
        let (root_a, root_from_source) = self.to_root(from);
        let (root_b, root_from_target) = self.to_root(to);
        if root_a != root_b {
            return None;
        }
        Some(root_from_target.inverse() * root_from_source)
    }
}
