//! Decay-tree node infrastructure: the node trait, the arena-backed tree,
//! and its builder.
//!
//! Nodes are addressed by stable integer indices. Mother links are plain
//! indices (never ownership), daughters are ordered index lists, so the
//! structure cannot form reference cycles. Every node reserves its state
//! slices from the tree's [`StateLayout`] exactly once, during
//! [`DecayTreeBuilder::build`]; afterwards the layout is sealed and the
//! offsets are immutable configuration.

use nalgebra::Vector3;

use crate::composite::{Composite, MissingMomentum, Resonance};
use crate::errcode::ErrCode;
use crate::error::FitError;
use crate::fitparams::{FitParams, IndexRange, NodeIndices, StateLayout};
use crate::fitter::FitConfig;
use crate::input::{MomentumErrorSource, MomentumScaleSource, TrajectorySource};
use crate::projection::Projection;
use crate::reco_track::RecoTrack;

/// Stable identifier of a node within its [`DecayTree`].
pub type NodeIndex = usize;

/// Everything the fit needs to know about one backing track.
pub trait TrackInput: TrajectorySource + MomentumErrorSource + MomentumScaleSource {}

impl<T: TrajectorySource + MomentumErrorSource + MomentumScaleSource> TrackInput for T {}

// ============================================================================
// NODE BEHAVIOR
// ============================================================================

/// The lifecycle operations every concrete participant implements.
///
/// The tree walk drives these in a fixed order: parameter seeding
/// (mother before daughters), post-daughter momentum seeding, covariance
/// seeding, then one projection per constraint per iteration. Failures
/// are reported through [`ErrCode`], never by panicking.
pub trait ParticleBase {
    /// Seed this node's parameters given an already-seeded mother.
    fn init_particle_with_mother(&mut self, state: &mut FitParams) -> ErrCode;

    /// Seed this node's parameters when it has no mother.
    fn init_motherless_particle(&mut self, state: &mut FitParams) -> ErrCode;

    /// Second seeding pass, run after all daughters are seeded. Composites
    /// sum their daughters' momenta here; leaves do nothing.
    fn init_momentum(&mut self, state: &mut FitParams) -> ErrCode {
        let _ = state;
        ErrCode::SUCCESS
    }

    /// Seed the rough covariance for this node's parameter blocks.
    fn init_covariance(&self, state: &mut FitParams) -> ErrCode;

    /// Measurement dimensions of the constraints this node contributes,
    /// one entry per constraint.
    fn constraint_dims(&self) -> &[usize];

    /// Fill `projection` for the constraint at `index`.
    fn project_constraint(
        &mut self,
        index: usize,
        state: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode;
}

/// Closed set of concrete participant kinds.
pub enum ParticleKind {
    /// Leaf backed by a measured charged trajectory.
    Track(RecoTrack),
    /// Internal particle with its own decay vertex.
    Composite(Composite),
    /// Short-lived state decaying at its mother's vertex.
    Resonance(Resonance),
    /// Unmeasured momentum placeholder (e.g. a neutrino).
    MissingMomentum(MissingMomentum),
}

impl ParticleKind {
    pub fn label(&self) -> &'static str {
        match self {
            ParticleKind::Track(_) => "track",
            ParticleKind::Composite(_) => "composite",
            ParticleKind::Resonance(_) => "resonance",
            ParticleKind::MissingMomentum(_) => "missing-momentum",
        }
    }

    fn as_base_mut(&mut self) -> &mut dyn ParticleBase {
        match self {
            ParticleKind::Track(p) => p,
            ParticleKind::Composite(p) => p,
            ParticleKind::Resonance(p) => p,
            ParticleKind::MissingMomentum(p) => p,
        }
    }

    fn as_base(&self) -> &dyn ParticleBase {
        match self {
            ParticleKind::Track(p) => p,
            ParticleKind::Composite(p) => p,
            ParticleKind::Resonance(p) => p,
            ParticleKind::MissingMomentum(p) => p,
        }
    }
}

impl ParticleBase for ParticleKind {
    fn init_particle_with_mother(&mut self, state: &mut FitParams) -> ErrCode {
        self.as_base_mut().init_particle_with_mother(state)
    }

    fn init_motherless_particle(&mut self, state: &mut FitParams) -> ErrCode {
        self.as_base_mut().init_motherless_particle(state)
    }

    fn init_momentum(&mut self, state: &mut FitParams) -> ErrCode {
        self.as_base_mut().init_momentum(state)
    }

    fn init_covariance(&self, state: &mut FitParams) -> ErrCode {
        self.as_base().init_covariance(state)
    }

    fn constraint_dims(&self) -> &[usize] {
        self.as_base().constraint_dims()
    }

    fn project_constraint(
        &mut self,
        index: usize,
        state: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        self.as_base_mut().project_constraint(index, state, projection)
    }
}

// ============================================================================
// NODE RECORD
// ============================================================================

/// One node of a decay tree.
pub struct Particle {
    /// Human-readable label for diagnostics.
    pub name: String,
    /// Electric charge; for composites, the sum over daughters.
    pub charge: f64,
    /// Non-owning back reference to the mother node.
    pub mother: Option<NodeIndex>,
    /// Owned daughter nodes, in insertion order.
    pub daughters: Vec<NodeIndex>,
    /// Reserved slices of the shared state vector.
    pub indices: NodeIndices,
    /// Kind-specific behavior and cached data.
    pub kind: ParticleKind,
}

// ============================================================================
// DECAY TREE
// ============================================================================

/// A fully built candidate tree, ready to fit.
pub struct DecayTree {
    nodes: Vec<Particle>,
    /// Depth-first pre-order starting at the root.
    order: Vec<NodeIndex>,
    root: NodeIndex,
    layout: StateLayout,
}

impl DecayTree {
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Total state dimension.
    pub fn dim(&self) -> usize {
        self.layout.dim()
    }

    pub fn node(&self, idx: NodeIndex) -> &Particle {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Particle {
        &mut self.nodes[idx]
    }

    /// Depth-first pre-order over all nodes.
    pub fn walk_order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Allocate the shared fit state sized for this tree.
    pub fn make_fit_params(&self) -> Result<FitParams, FitError> {
        FitParams::from_layout(&self.layout, self.nodes.len())
    }

    /// Largest measurement dimension among all constraints, for sizing
    /// the reusable projection buffer.
    pub fn max_constraint_dim(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.kind.constraint_dims().iter().copied())
            .max()
            .unwrap_or(0)
    }

    /// Total constraint rows contributed per iteration.
    pub fn total_constraint_dim(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.kind.constraint_dims().iter().copied())
            .sum()
    }

    /// Seed the state vector: depth-first, mother before daughters, with
    /// a post-daughter momentum pass for composites. Fatal codes abort
    /// immediately.
    pub fn seed(&mut self, params: &mut FitParams) -> ErrCode {
        let root = self.root;
        self.seed_node(root, params)
    }

    fn seed_node(&mut self, idx: NodeIndex, params: &mut FitParams) -> ErrCode {
        let mut status = if self.nodes[idx].mother.is_some() {
            self.nodes[idx].kind.init_particle_with_mother(params)
        } else {
            self.nodes[idx].kind.init_motherless_particle(params)
        };
        if status.is_fatal() {
            return status;
        }
        params.mark_initialized(idx);

        let daughters = self.nodes[idx].daughters.clone();
        for d in daughters {
            status |= self.seed_node(d, params);
            if status.is_fatal() {
                return status;
            }
        }
        status | self.nodes[idx].kind.init_momentum(params)
    }

    /// Seed the rough covariance of every node.
    pub fn init_covariances(&self, params: &mut FitParams) -> ErrCode {
        let mut status = ErrCode::SUCCESS;
        for &idx in &self.order {
            status |= self.nodes[idx].kind.init_covariance(params);
            if status.is_fatal() {
                return status;
            }
        }
        status
    }
}

// ============================================================================
// BUILDER
// ============================================================================

enum NodeSpec {
    Track { track: Box<dyn TrackInput> },
    Composite,
    Resonance,
    MissingMomentum,
}

struct SpecNode {
    name: String,
    spec: NodeSpec,
    mother: Option<NodeIndex>,
    daughters: Vec<NodeIndex>,
}

/// Incremental construction of a [`DecayTree`].
///
/// Nodes are appended with explicit mother links; [`build`](Self::build)
/// validates the topology, reserves all index ranges, resolves cached
/// cross-node ranges and seals the layout.
#[derive(Default)]
pub struct DecayTreeBuilder {
    specs: Vec<SpecNode>,
}

impl DecayTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&mut self, name: &str, spec: NodeSpec, mother: Option<NodeIndex>) -> Result<NodeIndex, FitError> {
        if let Some(m) = mother {
            let mother_spec = self.specs.get(m).ok_or(FitError::NodeOutOfRange(m))?;
            match mother_spec.spec {
                NodeSpec::Composite | NodeSpec::Resonance => {}
                NodeSpec::Track { .. } => return Err(FitError::LeafWithDaughters("track")),
                NodeSpec::MissingMomentum => {
                    return Err(FitError::LeafWithDaughters("missing-momentum"))
                }
            }
        }
        let idx = self.specs.len();
        self.specs.push(SpecNode {
            name: name.to_string(),
            spec,
            mother,
            daughters: Vec::new(),
        });
        if let Some(m) = mother {
            self.specs[m].daughters.push(idx);
        }
        Ok(idx)
    }

    /// Add an internal particle with its own decay vertex.
    pub fn add_composite(&mut self, name: &str, mother: Option<NodeIndex>) -> Result<NodeIndex, FitError> {
        self.attach(name, NodeSpec::Composite, mother)
    }

    /// Add a resonance decaying at its mother's vertex.
    pub fn add_resonance(&mut self, name: &str, mother: NodeIndex) -> Result<NodeIndex, FitError> {
        self.attach(name, NodeSpec::Resonance, Some(mother))
    }

    /// Add a track-backed leaf.
    pub fn add_track(
        &mut self,
        name: &str,
        mother: Option<NodeIndex>,
        track: Box<dyn TrackInput>,
    ) -> Result<NodeIndex, FitError> {
        self.attach(name, NodeSpec::Track { track }, mother)
    }

    /// Add an unmeasured-momentum placeholder leaf.
    pub fn add_missing_momentum(&mut self, name: &str, mother: NodeIndex) -> Result<NodeIndex, FitError> {
        self.attach(name, NodeSpec::MissingMomentum, Some(mother))
    }

    /// Validate, reserve state slices and produce the finished tree.
    pub fn build(self, config: &FitConfig) -> Result<DecayTree, FitError> {
        if self.specs.is_empty() {
            return Err(FitError::EmptyTree);
        }
        let roots: Vec<NodeIndex> = self
            .specs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.mother.is_none().then_some(i))
            .collect();
        if roots.len() != 1 {
            return Err(FitError::InvalidRoots(roots.len()));
        }
        let root = roots[0];

        // Depth-first pre-order
        let mut order = Vec::with_capacity(self.specs.len());
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            for &d in self.specs[idx].daughters.iter().rev() {
                stack.push(d);
            }
        }

        // Reserve index ranges in walk order
        let mut layout = StateLayout::new();
        let mut indices = vec![NodeIndices::default(); self.specs.len()];
        for &idx in &order {
            let spec = &self.specs[idx];
            indices[idx] = match spec.spec {
                NodeSpec::Composite => NodeIndices {
                    pos: Some(layout.reserve(3)?),
                    mom: Some(layout.reserve(3)?),
                    len: spec
                        .mother
                        .map(|_| layout.reserve(1))
                        .transpose()?,
                },
                NodeSpec::Track { .. }
                | NodeSpec::Resonance
                | NodeSpec::MissingMomentum => NodeIndices {
                    mom: Some(layout.reserve(3)?),
                    ..NodeIndices::default()
                },
            };
        }
        layout.seal();

        // Nearest ancestor (strictly above) that owns a vertex position.
        let n_nodes = self.specs.len();
        let mut mother_positions: Vec<Option<IndexRange>> = vec![None; n_nodes];
        for idx in 0..n_nodes {
            let mut walk = idx;
            while let Some(m) = self.specs[walk].mother {
                if let Some(pos) = indices[m].pos {
                    mother_positions[idx] = Some(pos);
                    break;
                }
                walk = m;
            }
        }

        // Charges bottom-up (reverse walk order visits daughters first).
        let mut charges = vec![0.0; n_nodes];
        for &idx in order.iter().rev() {
            charges[idx] = match &self.specs[idx].spec {
                NodeSpec::Track { track } => track.charge(),
                NodeSpec::MissingMomentum => 0.0,
                NodeSpec::Composite | NodeSpec::Resonance => self.specs[idx]
                    .daughters
                    .iter()
                    .map(|&d| charges[d])
                    .sum(),
            };
        }

        // Vertex seed estimate: mean perigee of all descendant tracks.
        let mut seed_vertices = vec![Vector3::zeros(); n_nodes];
        for idx in 0..n_nodes {
            let mut sum = Vector3::zeros();
            let mut count = 0usize;
            let mut stack = vec![idx];
            while let Some(n) = stack.pop() {
                if let NodeSpec::Track { track } = &self.specs[n].spec {
                    sum += track.helix_parameters().perigee();
                    count += 1;
                }
                stack.extend(self.specs[n].daughters.iter().copied());
            }
            if count > 0 {
                seed_vertices[idx] = sum / count as f64;
            }
        }

        // Assemble nodes with their cached cross-node ranges.
        let mut nodes: Vec<Option<Particle>> = (0..n_nodes).map(|_| None).collect();
        for (idx, spec) in self.specs.into_iter().enumerate() {
            let own = indices[idx];
            let mother_pos = mother_positions[idx];
            let daughter_moms: Vec<_> = spec
                .daughters
                .iter()
                .filter_map(|&d| indices[d].mom)
                .collect();

            let kind = match spec.spec {
                NodeSpec::Track { track } => {
                    ParticleKind::Track(RecoTrack::new(track, own, mother_pos, config))
                }
                NodeSpec::Composite => ParticleKind::Composite(Composite::new(
                    seed_vertices[idx],
                    own,
                    mother_pos,
                    daughter_moms,
                    config,
                )),
                NodeSpec::Resonance => {
                    ParticleKind::Resonance(Resonance::new(own, daughter_moms, config))
                }
                NodeSpec::MissingMomentum => {
                    ParticleKind::MissingMomentum(MissingMomentum::new(own, config))
                }
            };

            nodes[idx] = Some(Particle {
                name: spec.name,
                charge: charges[idx],
                mother: spec.mother,
                daughters: spec.daughters,
                indices: own,
                kind,
            });
        }
        let nodes: Vec<Particle> = nodes.into_iter().flatten().collect();

        Ok(DecayTree {
            nodes,
            order,
            root,
            layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::FitConfig;
    use crate::helix::Matrix5;
    use crate::input::RecordedTrack;

    fn toy_track(px: f64, py: f64, pz: f64, charge: f64, bz: f64) -> Box<RecordedTrack> {
        let pos = Vector3::zeros();
        let mom = Vector3::new(px, py, pz);
        Box::new(
            RecordedTrack::from_vertex(&pos, &mom, charge, bz, Matrix5::identity() * 1e-4)
                .unwrap(),
        )
    }

    fn two_track_tree() -> DecayTree {
        let config = FitConfig::default();
        let mut builder = DecayTreeBuilder::new();
        let root = builder.add_composite("D0", None).unwrap();
        builder
            .add_track("pi+", Some(root), toy_track(0.5, 0.1, 0.2, 1.0, config.bz))
            .unwrap();
        builder
            .add_track("K-", Some(root), toy_track(-0.4, 0.3, -0.1, -1.0, config.bz))
            .unwrap();
        builder.build(&config).unwrap()
    }

    #[test]
    fn test_index_ranges_cover_state_disjointly() {
        let tree = two_track_tree();

        let mut covered = vec![false; tree.dim()];
        for i in 0..tree.n_nodes() {
            for range in tree.node(i).indices.ranges() {
                for k in range.offset..range.end() {
                    assert!(!covered[k], "state index {} owned twice", k);
                    covered[k] = true;
                }
            }
        }
        assert!(
            covered.iter().all(|&c| c),
            "state vector not fully covered by node ranges"
        );
        // Root composite: pos 3 + mom 3; two tracks: mom 3 each
        assert_eq!(tree.dim(), 12);
    }

    #[test]
    fn test_charges_propagate_to_composite() {
        let tree = two_track_tree();
        assert_eq!(tree.node(tree.root()).charge, 0.0);
        assert_eq!(tree.node(tree.root()).daughters.len(), 2);
    }

    #[test]
    fn test_walk_order_is_mother_first() {
        let tree = two_track_tree();
        let order = tree.walk_order();
        assert_eq!(order[0], tree.root());
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_root_composite_has_no_flight_length() {
        let tree = two_track_tree();
        assert!(tree.node(tree.root()).indices.len.is_none());
        assert!(tree.node(tree.root()).indices.pos.is_some());
    }

    #[test]
    fn test_track_cannot_own_daughters() {
        let config = FitConfig::default();
        let mut builder = DecayTreeBuilder::new();
        let root = builder.add_composite("B0", None).unwrap();
        let trk = builder
            .add_track("mu+", Some(root), toy_track(1.0, 0.0, 0.5, 1.0, config.bz))
            .unwrap();
        assert!(matches!(
            builder.add_track("e-", Some(trk), toy_track(0.2, 0.1, 0.0, -1.0, config.bz)),
            Err(FitError::LeafWithDaughters(_))
        ));
    }

    #[test]
    fn test_single_root_enforced() {
        let config = FitConfig::default();
        let mut builder = DecayTreeBuilder::new();
        builder.add_composite("a", None).unwrap();
        builder.add_composite("b", None).unwrap();
        assert!(matches!(
            builder.build(&config),
            Err(FitError::InvalidRoots(2))
        ));

        assert!(matches!(
            DecayTreeBuilder::new().build(&FitConfig::default()),
            Err(FitError::EmptyTree)
        ));
    }

    #[test]
    fn test_resonance_daughter_reads_grandmother_vertex() {
        let config = FitConfig::default();
        let mut builder = DecayTreeBuilder::new();
        let b0 = builder.add_composite("B0", None).unwrap();
        let kstar = builder.add_resonance("K*0", b0).unwrap();
        builder
            .add_track("K+", Some(kstar), toy_track(0.6, 0.2, 0.1, 1.0, config.bz))
            .unwrap();
        builder
            .add_track("pi-", Some(kstar), toy_track(-0.3, 0.4, 0.0, -1.0, config.bz))
            .unwrap();
        let tree = builder.build(&config).unwrap();

        // The resonance shares its mother's vertex: no position block.
        assert!(tree.node(kstar).indices.pos.is_none());
        // B0 pos 3 + mom 3, K* mom 3, two tracks mom 3 each
        assert_eq!(tree.dim(), 15);
    }
}
