//! Internal tree nodes: composites with their own decay vertex, resonances
//! decaying at their mother's vertex, and unmeasured-momentum placeholders.
//!
//! Composites contribute two exact constraints (measurement covariance
//! zero): momentum conservation over their daughters, and, when they have
//! a mother, the geometric statement that the line from the mother vertex
//! along the momentum direction reaches their own vertex after the fitted
//! decay length.

use nalgebra::{DMatrix, Matrix3, Vector3};

use crate::errcode::ErrCode;
use crate::fitparams::{FitParams, IndexRange, NodeIndices};
use crate::fitter::FitConfig;
use crate::particle::ParticleBase;
use crate::projection::Projection;

/// A decaying particle with its own fitted vertex position.
pub struct Composite {
    seed_vertex: Vector3<f64>,
    indices: NodeIndices,
    mother_pos: Option<IndexRange>,
    daughter_moms: Vec<IndexRange>,
    position_seed_variance: f64,
    momentum_seed_variance: f64,
    length_seed_variance: f64,
    dims: Vec<usize>,
}

impl Composite {
    pub fn new(
        seed_vertex: Vector3<f64>,
        indices: NodeIndices,
        mother_pos: Option<IndexRange>,
        daughter_moms: Vec<IndexRange>,
        config: &FitConfig,
    ) -> Self {
        // Geometric constraint only exists for a mothered composite, and
        // is projected before momentum conservation.
        let dims = if indices.len.is_some() {
            vec![3, 3]
        } else {
            vec![3]
        };
        Self {
            seed_vertex,
            indices,
            mother_pos,
            daughter_moms,
            position_seed_variance: config.position_seed_variance,
            momentum_seed_variance: config.momentum_seed_variance,
            length_seed_variance: config.length_seed_variance,
            dims,
        }
    }

    /// Momentum conservation: sum of daughter momenta minus own momentum.
    fn project_kinematic(&self, state: &FitParams, projection: &mut Projection) -> ErrCode {
        let own_mom = match self.indices.mom {
            Some(range) => range,
            None => return ErrCode::BAD_SETUP,
        };

        let mut sum = Vector3::zeros();
        let identity = DMatrix::identity(3, 3);
        for &range in &self.daughter_moms {
            sum += state.vector3(range);
            // Daughter blocks may coincide only if the tree were malformed;
            // additive writes keep the projection correct regardless.
            projection.add_h_block(range, &identity);
        }
        let own = state.vector3(own_mom);
        projection.set_h_block(own_mom, &(-identity));

        let residual = sum - own;
        for k in 0..3 {
            projection.residual_mut()[k] = residual[k];
        }
        // Exact constraint: measurement covariance stays zero.
        ErrCode::SUCCESS
    }

    /// Geometric constraint: the mother vertex displaced by the decay
    /// length along the momentum direction must reach this vertex.
    fn project_geometric(&self, state: &FitParams, projection: &mut Projection) -> ErrCode {
        let (own_pos, own_mom, len_range, mother_pos) = match (
            self.indices.pos,
            self.indices.mom,
            self.indices.len,
            self.mother_pos,
        ) {
            (Some(p), Some(m), Some(l), Some(mp)) => (p, m, l, mp),
            _ => return ErrCode::MISSING_INPUT,
        };

        let x_mother = state.vector3(mother_pos);
        let x_own = state.vector3(own_pos);
        let mom = state.vector3(own_mom);
        let p = mom.norm();
        if p <= 0.0 {
            return ErrCode::MISSING_INPUT;
        }
        let dir = mom / p;
        let length = state.par()[len_range.offset];

        let residual = x_mother + length * dir - x_own;
        for k in 0..3 {
            projection.residual_mut()[k] = residual[k];
        }

        let identity = DMatrix::identity(3, 3);
        projection.set_h_block(mother_pos, &identity);
        projection.set_h_block(own_pos, &(-identity));

        let dir_block = DMatrix::from_column_slice(3, 1, dir.as_slice());
        projection.set_h_block(len_range, &dir_block);

        // d(length * p/|p|)/dp = length * (I - dir dir^T) / |p|
        let proj_matrix = (Matrix3::identity() - dir * dir.transpose()) * (length / p);
        let mut mom_block = DMatrix::zeros(3, 3);
        for i in 0..3 {
            for j in 0..3 {
                mom_block[(i, j)] = proj_matrix[(i, j)];
            }
        }
        projection.set_h_block(own_mom, &mom_block);

        ErrCode::SUCCESS
    }
}

impl ParticleBase for Composite {
    fn init_particle_with_mother(&mut self, state: &mut FitParams) -> ErrCode {
        let pos_range = match self.indices.pos {
            Some(range) => range,
            None => return ErrCode::BAD_SETUP,
        };
        state.set_vector3(pos_range, &self.seed_vertex);
        // Decay length starts at zero; init_momentum refines it once the
        // daughters carry momenta.
        if let Some(len_range) = self.indices.len {
            state.par_mut()[len_range.offset] = 0.0;
        }
        ErrCode::SUCCESS
    }

    fn init_motherless_particle(&mut self, state: &mut FitParams) -> ErrCode {
        let pos_range = match self.indices.pos {
            Some(range) => range,
            None => return ErrCode::BAD_SETUP,
        };
        state.set_vector3(pos_range, &self.seed_vertex);
        ErrCode::SUCCESS
    }

    fn init_momentum(&mut self, state: &mut FitParams) -> ErrCode {
        let own_mom = match self.indices.mom {
            Some(range) => range,
            None => return ErrCode::BAD_SETUP,
        };
        let mut sum = Vector3::zeros();
        for &range in &self.daughter_moms {
            sum += state.vector3(range);
        }
        state.set_vector3(own_mom, &sum);

        if let (Some(len_range), Some(mother_pos), Some(own_pos)) =
            (self.indices.len, self.mother_pos, self.indices.pos)
        {
            let p = sum.norm();
            if p > 0.0 {
                let displacement = state.vector3(own_pos) - state.vector3(mother_pos);
                state.par_mut()[len_range.offset] = displacement.dot(&sum) / p;
            }
        }
        ErrCode::SUCCESS
    }

    fn init_covariance(&self, state: &mut FitParams) -> ErrCode {
        let cov = state.cov_mut();
        if let Some(range) = self.indices.pos {
            for k in range.offset..range.end() {
                cov[(k, k)] = self.position_seed_variance;
            }
        }
        if let Some(range) = self.indices.mom {
            for k in range.offset..range.end() {
                cov[(k, k)] = self.momentum_seed_variance;
            }
        }
        if let Some(range) = self.indices.len {
            cov[(range.offset, range.offset)] = self.length_seed_variance;
        }
        ErrCode::SUCCESS
    }

    fn constraint_dims(&self) -> &[usize] {
        &self.dims
    }

    fn project_constraint(
        &mut self,
        index: usize,
        state: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        match (index, self.indices.len.is_some()) {
            (0, true) => self.project_geometric(state, projection),
            (1, true) | (0, false) => self.project_kinematic(state, projection),
            _ => ErrCode::BAD_SETUP,
        }
    }
}

// ============================================================================
// RESONANCE
// ============================================================================

/// A short-lived state that decays where it was produced: it owns a
/// momentum but shares its mother's vertex and has no decay length.
pub struct Resonance {
    indices: NodeIndices,
    daughter_moms: Vec<IndexRange>,
    momentum_seed_variance: f64,
    dims: [usize; 1],
}

impl Resonance {
    pub fn new(indices: NodeIndices, daughter_moms: Vec<IndexRange>, config: &FitConfig) -> Self {
        Self {
            indices,
            daughter_moms,
            momentum_seed_variance: config.momentum_seed_variance,
            dims: [3],
        }
    }
}

impl ParticleBase for Resonance {
    fn init_particle_with_mother(&mut self, _state: &mut FitParams) -> ErrCode {
        // Nothing positional to seed; the momentum comes from the
        // post-daughter pass.
        ErrCode::SUCCESS
    }

    fn init_motherless_particle(&mut self, _state: &mut FitParams) -> ErrCode {
        // A resonance needs a production vertex to live at.
        ErrCode::MISSING_INPUT
    }

    fn init_momentum(&mut self, state: &mut FitParams) -> ErrCode {
        let own_mom = match self.indices.mom {
            Some(range) => range,
            None => return ErrCode::BAD_SETUP,
        };
        let mut sum = Vector3::zeros();
        for &range in &self.daughter_moms {
            sum += state.vector3(range);
        }
        state.set_vector3(own_mom, &sum);
        ErrCode::SUCCESS
    }

    fn init_covariance(&self, state: &mut FitParams) -> ErrCode {
        if let Some(range) = self.indices.mom {
            let cov = state.cov_mut();
            for k in range.offset..range.end() {
                cov[(k, k)] = self.momentum_seed_variance;
            }
        }
        ErrCode::SUCCESS
    }

    fn constraint_dims(&self) -> &[usize] {
        &self.dims
    }

    fn project_constraint(
        &mut self,
        index: usize,
        state: &FitParams,
        projection: &mut Projection,
    ) -> ErrCode {
        if index != 0 {
            return ErrCode::BAD_SETUP;
        }
        let own_mom = match self.indices.mom {
            Some(range) => range,
            None => return ErrCode::BAD_SETUP,
        };

        let mut sum = Vector3::zeros();
        let identity = DMatrix::identity(3, 3);
        for &range in &self.daughter_moms {
            sum += state.vector3(range);
            projection.add_h_block(range, &identity);
        }
        projection.set_h_block(own_mom, &(-identity));

        let residual = sum - state.vector3(own_mom);
        for k in 0..3 {
            projection.residual_mut()[k] = residual[k];
        }
        ErrCode::SUCCESS
    }
}

// ============================================================================
// MISSING MOMENTUM
// ============================================================================

/// An unmeasured particle (e.g. a neutrino): three free momentum
/// parameters, constrained only through its mother's momentum balance.
pub struct MissingMomentum {
    indices: NodeIndices,
    momentum_seed_variance: f64,
}

impl MissingMomentum {
    pub fn new(indices: NodeIndices, config: &FitConfig) -> Self {
        Self {
            indices,
            momentum_seed_variance: config.momentum_seed_variance,
        }
    }
}

impl ParticleBase for MissingMomentum {
    fn init_particle_with_mother(&mut self, state: &mut FitParams) -> ErrCode {
        // No measurement to seed from: start at zero momentum and let the
        // mother's momentum balance pull it in.
        let own_mom = match self.indices.mom {
            Some(range) => range,
            None => return ErrCode::BAD_SETUP,
        };
        state.set_vector3(own_mom, &Vector3::zeros());
        ErrCode::SUCCESS
    }

    fn init_motherless_particle(&mut self, _state: &mut FitParams) -> ErrCode {
        // Without a mother there is no balance to recover it from.
        ErrCode::MISSING_INPUT
    }

    fn init_covariance(&self, state: &mut FitParams) -> ErrCode {
        if let Some(range) = self.indices.mom {
            let cov = state.cov_mut();
            for k in range.offset..range.end() {
                cov[(k, k)] = self.momentum_seed_variance;
            }
        }
        ErrCode::SUCCESS
    }

    fn constraint_dims(&self) -> &[usize] {
        &[]
    }

    fn project_constraint(
        &mut self,
        _index: usize,
        _state: &FitParams,
        _projection: &mut Projection,
    ) -> ErrCode {
        ErrCode::BAD_SETUP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitparams::StateLayout;
    use approx::assert_relative_eq;

    struct Layout {
        mother_pos: IndexRange,
        own_pos: IndexRange,
        own_mom: IndexRange,
        len: IndexRange,
        d1: IndexRange,
        d2: IndexRange,
        params: FitParams,
    }

    fn mothered_layout() -> Layout {
        let mut layout = StateLayout::new();
        let mother_pos = layout.reserve(3).unwrap();
        let own_pos = layout.reserve(3).unwrap();
        let own_mom = layout.reserve(3).unwrap();
        let len = layout.reserve(1).unwrap();
        let d1 = layout.reserve(3).unwrap();
        let d2 = layout.reserve(3).unwrap();
        layout.seal();
        let params = FitParams::from_layout(&layout, 4).unwrap();
        Layout {
            mother_pos,
            own_pos,
            own_mom,
            len,
            d1,
            d2,
            params,
        }
    }

    fn mothered_composite(l: &Layout) -> Composite {
        Composite::new(
            Vector3::new(1.0, 0.5, -0.2),
            NodeIndices {
                pos: Some(l.own_pos),
                mom: Some(l.own_mom),
                len: Some(l.len),
            },
            Some(l.mother_pos),
            vec![l.d1, l.d2],
            &FitConfig::default(),
        )
    }

    #[test]
    fn test_momentum_seed_sums_daughters_and_seeds_length() {
        let mut l = mothered_layout();
        let mut node = mothered_composite(&l);

        assert!(node.init_particle_with_mother(&mut l.params).is_success());
        l.params.set_vector3(l.d1, &Vector3::new(0.4, 0.1, 0.2));
        l.params.set_vector3(l.d2, &Vector3::new(0.6, -0.1, 0.3));
        assert!(node.init_momentum(&mut l.params).is_success());

        let total = Vector3::new(1.0, 0.0, 0.5);
        assert_relative_eq!(l.params.vector3(l.own_mom), total, epsilon = 1e-12);

        // Seeded decay length is the displacement projected on momentum.
        let displacement = l.params.vector3(l.own_pos) - l.params.vector3(l.mother_pos);
        let expected = displacement.dot(&total) / total.norm();
        assert_relative_eq!(l.params.par()[l.len.offset], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_kinematic_residual_vanishes_when_balanced() {
        let mut l = mothered_layout();
        let mut node = mothered_composite(&l);

        l.params.set_vector3(l.d1, &Vector3::new(0.4, 0.1, 0.2));
        l.params.set_vector3(l.d2, &Vector3::new(0.6, -0.1, 0.3));
        l.params.set_vector3(l.own_mom, &Vector3::new(1.0, 0.0, 0.5));

        let mut proj = Projection::new(3, l.params.dim());
        // Mothered composite: kinematic constraint is index 1.
        assert!(node.project_constraint(1, &l.params, &mut proj).is_success());
        assert!(proj.residual().norm() < 1e-12);

        // Exact constraint, no measurement noise.
        assert_eq!(proj.v_symmetric().norm(), 0.0);
        // +I on daughters, -I on own momentum
        assert_eq!(proj.h()[(0, l.d1.offset)], 1.0);
        assert_eq!(proj.h()[(0, l.d2.offset)], 1.0);
        assert_eq!(proj.h()[(0, l.own_mom.offset)], -1.0);
    }

    #[test]
    fn test_geometric_residual_and_jacobian() {
        let mut l = mothered_layout();
        let mut node = mothered_composite(&l);

        let mother = Vector3::new(0.1, 0.2, 0.3);
        let mom = Vector3::new(0.0, 2.0, 0.0);
        let length = 1.5;
        l.params.set_vector3(l.mother_pos, &mother);
        l.params.set_vector3(l.own_mom, &mom);
        l.params.par_mut()[l.len.offset] = length;
        // Vertex exactly where the line lands: residual zero
        l.params
            .set_vector3(l.own_pos, &(mother + length * Vector3::new(0.0, 1.0, 0.0)));

        let mut proj = Projection::new(3, l.params.dim());
        assert!(node.project_constraint(0, &l.params, &mut proj).is_success());
        assert!(proj.residual().norm() < 1e-12);

        // Length column carries the unit direction.
        assert_relative_eq!(proj.h()[(1, l.len.offset)], 1.0);
        assert_relative_eq!(proj.h()[(0, l.len.offset)], 0.0);
        // Momentum columns: length/|p| * (I - dir dir^T); the component
        // along the direction itself does not move the endpoint.
        assert_relative_eq!(proj.h()[(1, l.own_mom.offset + 1)], 0.0);
        assert_relative_eq!(proj.h()[(0, l.own_mom.offset)], length / mom.norm());
    }

    #[test]
    fn test_root_composite_has_single_constraint() {
        let mut layout = StateLayout::new();
        let own_pos = layout.reserve(3).unwrap();
        let own_mom = layout.reserve(3).unwrap();
        let d1 = layout.reserve(3).unwrap();
        layout.seal();
        let params = FitParams::from_layout(&layout, 2).unwrap();

        let mut node = Composite::new(
            Vector3::zeros(),
            NodeIndices {
                pos: Some(own_pos),
                mom: Some(own_mom),
                len: None,
            },
            None,
            vec![d1],
            &FitConfig::default(),
        );
        assert_eq!(node.constraint_dims(), &[3]);

        // Index 0 maps to the kinematic constraint for a root.
        let mut proj = Projection::new(3, params.dim());
        assert!(node.project_constraint(0, &params, &mut proj).is_success());
        // Out-of-range index is a setup error.
        assert!(node.project_constraint(1, &params, &mut proj).is_fatal());
    }

    #[test]
    fn test_missing_momentum_needs_a_mother() {
        let mut layout = StateLayout::new();
        let mom = layout.reserve(3).unwrap();
        layout.seal();
        let mut params = FitParams::from_layout(&layout, 1).unwrap();

        let mut node = MissingMomentum::new(
            NodeIndices {
                mom: Some(mom),
                ..NodeIndices::default()
            },
            &FitConfig::default(),
        );
        assert!(node.init_motherless_particle(&mut params).is_fatal());
        assert!(node.init_particle_with_mother(&mut params).is_success());
        assert!(node.constraint_dims().is_empty());
    }

    #[test]
    fn test_resonance_sums_daughters() {
        let mut layout = StateLayout::new();
        let own_mom = layout.reserve(3).unwrap();
        let d1 = layout.reserve(3).unwrap();
        let d2 = layout.reserve(3).unwrap();
        layout.seal();
        let mut params = FitParams::from_layout(&layout, 3).unwrap();

        let mut node = Resonance::new(
            NodeIndices {
                mom: Some(own_mom),
                ..NodeIndices::default()
            },
            vec![d1, d2],
            &FitConfig::default(),
        );

        params.set_vector3(d1, &Vector3::new(0.3, 0.0, 0.1));
        params.set_vector3(d2, &Vector3::new(0.2, 0.4, -0.1));
        assert!(node.init_momentum(&mut params).is_success());
        assert_relative_eq!(
            params.vector3(own_mom),
            Vector3::new(0.5, 0.4, 0.0),
            epsilon = 1e-12
        );

        let mut proj = Projection::new(3, params.dim());
        assert!(node.project_constraint(0, &params, &mut proj).is_success());
        assert!(proj.residual().norm() < 1e-12);
    }
}
