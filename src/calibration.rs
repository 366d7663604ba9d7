use nalgebra::Vector3;
use rayon::prelude::*;

use crate::brdf;
use crate::pattern::{self, IntersectionData, PatternData, WeaveParameters};
use crate::sampling;
use crate::textures::TexmapContext;

type Vec3f = Vector3<f32>;

const N_LOCATION_SAMPLES: usize = 100;
const N_DIRECTION_SAMPLES: usize = 1000;

/// Normalization constant bounding the specular peak: the largest
/// per-location reflection sum across all yarn types, found by
/// stratified Monte-Carlo integration, inverted against the direction
/// sample count. A vanishing peak yields 0, disabling specular rather
/// than dividing by a near-zero estimate.
///
/// Runs on the raw branch evaluators, so neither the normalization nor
/// the intensity grain biases the estimate.
pub fn calibrate(params: &WeaveParameters) -> f32 {
    let highest = (0..params.yarn_types.len() as u32)
        .map(|yarn_type| yarn_type_peak(params, yarn_type))
        .fold(0.0_f32, f32::max);
    if highest <= 1.0e-4 {
        0.0
    } else {
        N_DIRECTION_SAMPLES as f32 / highest
    }
}

/// Largest per-location reflection sum for one yarn type. Locations
/// are independent, so the loop runs in parallel; the max reduction is
/// order-insensitive.
fn yarn_type_peak(params: &WeaveParameters, yarn_type: u32) -> f32 {
    (0..N_LOCATION_SAMPLES)
        .into_par_iter()
        .map(|i| location_sum(params, yarn_type, i))
        .reduce(|| 0.0_f32, f32::max)
}

/// Reflection integrated over outgoing directions at one stratified
/// segment location with one stratified incoming direction.
fn location_sum(params: &WeaveParameters, yarn_type: u32, i: usize) -> f32 {
    let point = sampling::halton_4(i + 50);
    let mut data = PatternData {
        yarn_type,
        x: -1.0 + 2.0 * point[0],
        y: -1.0 + 2.0 * point[1],
        length: 1.0,
        width: 1.0,
        warp_above: false,
        ..Default::default()
    };
    pattern::set_segment_uv_and_normal(&mut data, params.yarn(yarn_type).umax);

    let wi = sampling::hemisphere_zup_uniform(&[point[2], point[3]]);
    let wi = Vec3f::new(wi[0], wi[1], wi[2]);

    let mut sum = 0.0;
    for j in 0..N_DIRECTION_SAMPLES {
        let dir = sampling::halton_4(j + 50 + N_LOCATION_SAMPLES);
        // Cosine-weighted outgoing directions absorb the cosine term
        // of the integrand.
        let wo = sampling::hemisphere_zup_cos_weighted(&[dir[0], dir[1]]);
        let intersection = IntersectionData {
            uv: [0.0, 0.0],
            wi,
            wo: Vec3f::new(wo[0], wo[1], wo[2]),
            context: TexmapContext::default(),
        };
        sum += brdf::eval_specular_raw(&intersection, &data, params);
    }
    sum
}

#[test]
fn test_calibration_is_finite_and_repeatable() {
    let mut params = pattern::plain_weave(2, 2);
    params.finalize();
    let first = params.specular_normalization();
    assert!(first.is_finite());
    assert!(first >= 0.0);
    params.finalize();
    assert_eq!(params.specular_normalization(), first);
}

#[test]
fn test_normalized_specular_respects_the_calibration_bound() {
    let mut params = pattern::plain_weave(2, 2);
    params.finalize();
    // Re-integrating the calibration's own sample points with the
    // normalization applied can never exceed the direction sample
    // count: every location sum is at most the peak.
    for i in 0..N_LOCATION_SAMPLES {
        let normalized = location_sum(&params, 0, i) * params.specular_normalization();
        assert!(
            normalized <= N_DIRECTION_SAMPLES as f32 * (1.0 + 1.0e-3),
            "location {i} integrates to {normalized}"
        );
    }
}
