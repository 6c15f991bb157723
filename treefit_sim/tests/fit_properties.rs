//! Property and end-to-end tests driving the fit engine through the
//! public API with generated inputs.

use nalgebra::Vector3;
use proptest::prelude::*;
use std::f64::consts::PI;

use treefit_core::helix;
use treefit_core::{DecayTreeBuilder, FitConfig, FitState, Fitter};
use treefit_sim::Oracle;

fn momentum_strategy() -> impl Strategy<Value = Vector3<f64>> {
    // Transverse momentum kept well away from the degenerate axis.
    (
        0.2f64..2.0,
        -PI..PI,
        -2.0f64..2.0,
    )
        .prop_map(|(pt, phi, pz)| Vector3::new(pt * phi.cos(), pt * phi.sin(), pz))
}

fn position_strategy() -> impl Strategy<Value = Vector3<f64>> {
    (-2.0f64..2.0, -2.0f64..2.0, -5.0f64..5.0).prop_map(|(x, y, z)| Vector3::new(x, y, z))
}

proptest! {
    #[test]
    fn prop_wrap_angle_stays_in_range(x in -100.0f64..100.0) {
        let w = helix::wrap_angle(x);
        prop_assert!(w > -PI && w <= PI);
        // Wrapping changes the angle by a whole number of turns.
        let turns = (x - w) / (2.0 * PI);
        prop_assert!((turns - turns.round()).abs() < 1e-9);
    }

    #[test]
    fn prop_helix_roundtrip_recovers_vertex(
        pos in position_strategy(),
        mom in momentum_strategy(),
        charge in prop_oneof![Just(1.0f64), Just(-1.0f64)],
        bz in prop_oneof![Just(0.0f64), Just(1.5f64)],
    ) {
        let (h, flight) = helix::helix_from_vertex(&pos, &mom, charge, bz).unwrap();
        let (pos2, mom2) = helix::vertex_from_helix(&h, flight, mom.xy().norm());
        prop_assert!((pos2 - pos).norm() < 1e-8, "pos {:?} vs {:?}", pos2, pos);
        prop_assert!((mom2 - mom).norm() < 1e-8);
    }

    #[test]
    fn prop_poca_of_on_trajectory_point_is_its_arc_length(
        pos in position_strategy(),
        mom in momentum_strategy(),
        charge in prop_oneof![Just(1.0f64), Just(-1.0f64)],
    ) {
        let (h, flight) = helix::helix_from_vertex(&pos, &mom, charge, 1.5).unwrap();
        let s = helix::arc_length_at_poca(&h, pos.x, pos.y).unwrap();
        prop_assert!((s - flight).abs() < 1e-7, "s = {}, flight = {}", s, flight);
    }
}

#[test]
fn end_to_end_single_vertex_fit_recovers_generated_vertex() {
    let config = FitConfig::default();
    let mut oracle = Oracle::new(42, config.bz);
    let event = oracle.single_vertex_event(4).unwrap();

    let mut builder = DecayTreeBuilder::new();
    let root = builder.add_composite("mother", None).unwrap();
    for (k, track) in event.tracks.iter().enumerate() {
        builder
            .add_track(&format!("track{}", k), Some(root), Box::new(track.record.clone()))
            .unwrap();
    }
    let tree = builder.build(&config).unwrap();

    let mut fitter = Fitter::new(tree, config).unwrap();
    let status = fitter.fit();
    assert!(!status.is_fatal(), "fit failed with {}", status);
    assert_eq!(fitter.state(), FitState::Converged);

    let fitted = fitter.vertex_position(root).unwrap();
    // Four tracks with ~50 um impact resolution pin the vertex to well
    // under a millimeter.
    assert!(
        (fitted - event.vertex).norm() < 0.05,
        "fitted {:?} vs truth {:?}",
        fitted,
        event.vertex
    );
    assert!(fitter.ndf() > 0);
}

#[test]
fn end_to_end_fit_is_deterministic() {
    let run = || {
        let config = FitConfig::default();
        let mut oracle = Oracle::new(9, config.bz);
        let event = oracle.single_vertex_event(3).unwrap();
        let mut builder = DecayTreeBuilder::new();
        let root = builder.add_composite("mother", None).unwrap();
        for (k, track) in event.tracks.iter().enumerate() {
            builder
                .add_track(&format!("t{}", k), Some(root), Box::new(track.record.clone()))
                .unwrap();
        }
        let tree = builder.build(&config).unwrap();
        let mut fitter = Fitter::new(tree, config).unwrap();
        fitter.fit();
        (fitter.chi_square(), fitter.vertex_position(root).unwrap())
    };
    assert_eq!(run(), run());
}
