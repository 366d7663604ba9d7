use std::f32::consts::{FRAC_1_PI, FRAC_PI_2, PI};

use nalgebra::Vector3;

use crate::pattern::{self, IntersectionData, PatternData, WeaveParameters, YarnFiber};
use crate::sampling;

type Vec3f = Vector3<f32>;

pub type Color = [f32; 3];

/// von Mises lobe with mean 0 and concentration `b`, evaluated at
/// `cos_x`. The I0 Bessel factor uses the Abramowitz & Stegun
/// polynomial approximations, split at |b| = 3.75.
pub fn von_mises(cos_x: f32, b: f32) -> f32 {
    let abs_b = b.abs();
    let i0 = if abs_b <= 3.75 {
        let mut t = abs_b / 3.75;
        t = t * t;
        1.0 + t * (3.5156229
            + t * (3.0899424
                + t * (1.2067492 + t * (0.2659732 + t * (0.0360768 + t * 0.0045813)))))
    } else {
        let t = 3.75 / abs_b;
        abs_b.exp() / abs_b.sqrt()
            * (0.39894228
                + t * (0.01328592
                    + t * (0.00225319
                        + t * (-0.00157565
                            + t * (0.00916281
                                + t * (-0.02057706
                                    + t * (0.02635537
                                        + t * (-0.01647633 + t * 0.00392377))))))))
    };
    (b * cos_x).exp() / (2.0 * PI * i0)
}

/// Rotate a shading-space direction into the frame where the yarn runs
/// along y (weft-dominant cells are stored rotated a quarter turn).
fn to_yarn_frame(d: Vec3f, warp_above: bool) -> Vec3f {
    if warp_above {
        d
    } else {
        Vec3f::new(-d.y, d.x, d.z)
    }
}

/// Masking/shadowing factor from the clamped direction cosines against
/// the highlight normal; zero when either side faces away.
fn masking_term(wi: &Vec3f, wo: &Vec3f, highlight_normal: &Vec3f) -> f32 {
    let widotn = wi.dot(highlight_normal).max(0.0);
    let wodotn = wo.dot(highlight_normal).max(0.0);
    if widotn > 0.0 && wodotn > 0.0 {
        0.25 * FRAC_1_PI * (widotn * wodotn) / (widotn + wodotn)
    } else {
        0.0
    }
}

/// Single-scattering highlight of a smooth filament yarn (Irawan's
/// model). Zero whenever the highlight angle implied by the half
/// vector has no valid position on the segment, or lies outside the
/// delta_x tolerance of the sampled position.
pub fn eval_filament_specular(
    intersection: &IntersectionData,
    data: &PatternData,
    params: &WeaveParameters,
) -> f32 {
    let wi = to_yarn_frame(intersection.wi, data.warp_above);
    let wo = to_yarn_frame(intersection.wo, data.warp_above);
    let h = (wi + wo).normalize();

    let v = data.v;
    let y = data.y;

    let yarn = params.yarn(data.yarn_type);
    let umax = yarn.umax;

    // Highlight angle as a function of the half vector; the +pi/2
    // offset follows the reference formulation.
    let specular_u = (-h.z).atan2(h.y) + FRAC_PI_2;
    if specular_u.abs() >= umax {
        return 0.0;
    }

    let highlight_normal =
        Vec3f::new(v.sin(), specular_u.sin() * v.cos(), specular_u.cos() * v.cos()).normalize();
    let highlight_tangent = Vec3f::new(0.0, specular_u.cos(), -specular_u.sin()).normalize();

    let delta_x = yarn.delta_x;
    let mut specular_y = specular_u / umax;
    specular_y = specular_y.min(1.0 - delta_x);
    specular_y = specular_y.max(-1.0 + delta_x);

    if (specular_y - y).abs() >= delta_x {
        return 0.0;
    }

    // Curvature term Gu: yarn radius 1, radius of curvature 1/sin(umax).
    let r = 1.0 / umax.sin();
    let gu = (r + v.cos()) / ((wi + wo).norm() * highlight_tangent.cross(&h).x.abs());

    let fc = yarn.alpha + von_mises(-wi.dot(&wo), yarn.beta);

    let a = masking_term(&wi, &wo, &highlight_normal);
    if a <= 0.0 {
        return 0.0;
    }

    // Canonical segment half length.
    let l = 2.0;
    2.0 * l * umax * fc * gu * a / delta_x
}

/// Single-scattering highlight of a twisted staple yarn. The highlight
/// is located in v instead of u, so the tolerance test runs against
/// the across-yarn coordinate x.
pub fn eval_staple_specular(
    intersection: &IntersectionData,
    data: &PatternData,
    params: &WeaveParameters,
    psi: f32,
) -> f32 {
    let wi = to_yarn_frame(intersection.wi, data.warp_above);
    let wo = to_yarn_frame(intersection.wo, data.warp_above);
    let h = (wi + wo).normalize();

    let u = data.u;
    let x = data.x;

    let d = {
        let a = h.y * u.sin() + h.z * u.cos();
        (h.y * u.cos() - h.z * u.sin()) / (h.x * h.x + a * a).sqrt() / psi.tan()
    };
    // acos goes NaN for |d| > 1; NaN fails the window test below, so
    // the contribution is zero, as in the reference formulation.
    let specular_v = (-h.y * u.sin() - h.z * u.cos()).atan2(h.x) + d.acos();
    if !(specular_v.abs() < FRAC_PI_2 && d.abs() < 1.0) {
        return 0.0;
    }

    let highlight_normal = Vec3f::new(
        specular_v.sin(),
        u.sin() * specular_v.cos(),
        u.cos() * specular_v.cos(),
    )
    .normalize();

    let yarn = params.yarn(data.yarn_type);
    let delta_x = yarn.delta_x;
    let umax = yarn.umax;

    let mut specular_x = specular_v / FRAC_PI_2;
    specular_x = specular_x.min(1.0 - delta_x);
    specular_x = specular_x.max(-1.0 + delta_x);

    if (specular_x - x).abs() >= delta_x {
        return 0.0;
    }

    let r = 1.0 / umax.sin();
    let gv =
        (r + specular_v.cos()) / ((wi + wo).norm() * highlight_normal.dot(&h) * psi.sin().abs());

    let fc = yarn.alpha + von_mises(-wi.dot(&wo), yarn.beta);

    let a = masking_term(&wi, &wo, &highlight_normal);
    if a <= 0.0 {
        return 0.0;
    }

    // Canonical segment half width.
    let w = 2.0;
    2.0 * w * umax * fc * gv * a / delta_x
}

/// Hashed multiplicative brightness grain per yarn segment. Pure in
/// its inputs: identical positions always hash to identical grain.
pub fn intensity_variation(data: &PatternData, params: &WeaveParameters) -> f32 {
    if params.intensity_fineness < 0.001 {
        return 1.0;
    }

    // Follow the yarn-along-y convention used by the segment
    // coordinates when picking hash keys.
    let (tindex_x, tindex_y) = if data.warp_above {
        (data.total_index_x, data.total_index_y)
    } else {
        (data.total_index_y, data.total_index_x)
    };

    // Segment start position.
    let center_x = tindex_x as f32 - data.x * 0.5 * data.width;
    let center_y = tindex_y as f32 - data.y * 0.5 * data.length;

    let r1 = ((center_x + tindex_x as f32) * params.intensity_fineness) as u32;
    let r2 = ((center_y + tindex_y as f32) * params.intensity_fineness) as u32;

    let xi = sampling::sample_tea_float(r1, r2, 8);
    (-xi.ln()).min(10.0)
}

/// Branch dispatch without normalization or grain; the calibrator
/// integrates this directly.
pub(crate) fn eval_specular_raw(
    intersection: &IntersectionData,
    data: &PatternData,
    params: &WeaveParameters,
) -> f32 {
    // The yarn family was fixed at load time from psi; the two
    // branches behave differently numerically and are kept separate.
    match params.yarn(data.yarn_type).fiber {
        YarnFiber::Filament => eval_filament_specular(intersection, data, params),
        YarnFiber::Staple { psi } => eval_staple_specular(intersection, data, params, psi),
    }
}

/// Specular response of the resolved segment, including the calibrated
/// normalization and the intensity grain.
pub fn eval_specular(
    intersection: &IntersectionData,
    data: &PatternData,
    params: &WeaveParameters,
) -> f32 {
    if !params.has_pattern() {
        return 0.0;
    }
    eval_specular_raw(intersection, data, params)
        * params.specular_normalization()
        * intensity_variation(data, params)
}

/// Lambertian-style diffuse term: base (or texture-resolved) yarn
/// color scaled by the incoming direction's surface cosine. Requires a
/// non-empty yarn-type table; `shade` guards the empty-pattern case.
pub fn eval_diffuse(
    intersection: &IntersectionData,
    data: &PatternData,
    params: &WeaveParameters,
) -> Color {
    let value = intersection.wi.z;

    let mut yarn = params.yarn(data.yarn_type);
    if !yarn.color_enabled {
        yarn = &params.yarn_types[0];
    }
    let color = match &yarn.color_texmap {
        Some(texmap) => texmap.eval_color(&intersection.context),
        None => yarn.color,
    };
    [color[0] * value, color[1] * value, color[2] * value]
}

/// Shading entry point, called once per sample. Pure and lock-free;
/// safe to call concurrently once `finalize` has completed.
pub fn shade(intersection: &IntersectionData, params: &WeaveParameters) -> Color {
    if !params.has_pattern() {
        return [0.0; 3];
    }
    let data = pattern::pattern_data(intersection, params);
    let diffuse = eval_diffuse(intersection, &data, params);
    let specular = eval_specular(intersection, &data, params);
    let s = params.yarn(data.yarn_type).specular_strength;
    [
        diffuse[0] * (1.0 - s) + s * specular,
        diffuse[1] * (1.0 - s) + s * specular,
        diffuse[2] * (1.0 - s) + s * specular,
    ]
}

#[cfg(test)]
use crate::pattern::YarnType;
#[cfg(test)]
use crate::textures::TexmapContext;

#[cfg(test)]
fn intersection_with(uv: [f32; 2], wi: [f32; 3], wo: [f32; 3]) -> IntersectionData<'static> {
    IntersectionData {
        uv,
        wi: Vec3f::new(wi[0], wi[1], wi[2]),
        wo: Vec3f::new(wo[0], wo[1], wo[2]),
        context: TexmapContext::default(),
    }
}

#[test]
fn test_von_mises_is_positive_and_continuous_at_regime_split() {
    for cos_x in [-1.0, -0.3, 0.0, 0.5, 1.0] {
        for b in [0.0, 0.5, 2.0, 3.75, 5.0, 20.0] {
            assert!(von_mises(cos_x, b) > 0.0);
        }
        let lo = von_mises(cos_x, 3.74);
        let hi = von_mises(cos_x, 3.76);
        assert!((lo - hi).abs() < 0.05 * lo.max(hi));
    }
}

#[test]
fn test_intensity_variation_disabled_when_fineness_is_zero() {
    let params = pattern::plain_weave(2, 2);
    let data = pattern::pattern_data(
        &intersection_with([0.25, 0.25], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
        &params,
    );
    assert_eq!(intensity_variation(&data, &params), 1.0);
}

#[test]
fn test_intensity_variation_is_deterministic_and_bounded() {
    let mut params = pattern::plain_weave(2, 2);
    params.intensity_fineness = 2.0;
    for i in 0..40 {
        let uv = [0.13 + i as f32 * 0.37, 0.71 + i as f32 * 0.23];
        let data = pattern::pattern_data(
            &intersection_with(uv, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]),
            &params,
        );
        let a = intensity_variation(&data, &params);
        let b = intensity_variation(&data, &params);
        assert_eq!(a, b);
        assert!(a > 0.0 && a <= 10.0, "grain = {a}");
    }
}

#[test]
fn test_filament_specular_zero_outside_validity_window() {
    // Yarn type with a narrow bend angle; a half vector lying along +y
    // puts the candidate highlight angle at pi/2, beyond umax.
    let mut params = pattern::plain_weave(2, 2);
    params.yarn_types[0].fiber = YarnFiber::Filament;
    params.yarn_types[0].umax = 0.5;
    // Warp-dominant cell, so no frame rotation is applied.
    let isect = intersection_with([0.25, 0.25], [0.0, 1.0, 0.0], [0.0, 1.0, 0.0]);
    let data = pattern::pattern_data(&isect, &params);
    assert!(data.warp_above);
    assert_eq!(eval_filament_specular(&isect, &data, &params), 0.0);
}

#[test]
fn test_filament_specular_zero_outside_tolerance_window() {
    // Straight-out directions put the highlight at the segment center;
    // sample near the segment end, outside the delta_x window.
    let mut params = pattern::plain_weave(2, 2);
    params.yarn_types[0].fiber = YarnFiber::Filament;
    params.yarn_types[0].umax = FRAC_PI_2;
    params.yarn_types[0].delta_x = 0.1;
    let isect = intersection_with([0.05, 0.45], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]);
    let data = pattern::pattern_data(&isect, &params);
    assert!(data.warp_above);
    assert!(data.y > 0.5, "y = {}", data.y);
    assert_eq!(eval_filament_specular(&isect, &data, &params), 0.0);
}

#[test]
fn test_staple_specular_zero_when_no_highlight_direction_exists() {
    // Grazing half vector along the yarn axis drives |D| beyond 1, so
    // no highlight angle solves the staple equation.
    let params = pattern::plain_weave(2, 2);
    let isect = intersection_with([0.25, 0.25], [0.0, 1.0, 0.0], [0.0, 1.0, 0.0]);
    let data = pattern::pattern_data(&isect, &params);
    let psi = match params.yarn_types[0].fiber {
        YarnFiber::Staple { psi } => psi,
        YarnFiber::Filament => unreachable!(),
    };
    assert_eq!(eval_staple_specular(&isect, &data, &params, psi), 0.0);
}

#[test]
fn test_diffuse_scales_with_incoming_z() {
    let mut params = pattern::plain_weave(2, 2);
    params.yarn_types[0].color = [0.2, 0.4, 0.8];
    let isect = intersection_with([0.25, 0.25], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]);
    let data = pattern::pattern_data(&isect, &params);
    assert_eq!(eval_diffuse(&isect, &data, &params), [0.2, 0.4, 0.8]);

    let half = intersection_with([0.25, 0.25], [0.0, 0.0, 0.5], [0.0, 0.0, 1.0]);
    assert_eq!(eval_diffuse(&half, &data, &params), [0.1, 0.2, 0.4]);
}

#[test]
fn test_diffuse_falls_back_to_first_yarn_color() {
    let mut params = pattern::plain_weave(2, 2);
    params.yarn_types[0].color = [0.9, 0.1, 0.1];
    params.yarn_types.push(YarnType {
        color: [0.0, 1.0, 0.0],
        color_enabled: false,
        ..YarnType::default()
    });
    for entry in &mut params.pattern.entries {
        entry.yarn_type = 1;
    }
    let isect = intersection_with([0.25, 0.25], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]);
    let data = pattern::pattern_data(&isect, &params);
    assert_eq!(data.yarn_type, 1);
    assert_eq!(eval_diffuse(&isect, &data, &params), [0.9, 0.1, 0.1]);
}

#[test]
fn test_diffuse_texture_overrides_base_color() {
    use crate::textures::ConstantTexture;
    use std::sync::Arc;
    let mut params = pattern::plain_weave(2, 2);
    params.yarn_types[0].color = [1.0, 1.0, 1.0];
    params.yarn_types[0].color_texmap = Some(Arc::new(ConstantTexture([0.6, 0.5, 0.4])));
    let isect = intersection_with([0.25, 0.25], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]);
    let data = pattern::pattern_data(&isect, &params);
    assert_eq!(eval_diffuse(&isect, &data, &params), [0.6, 0.5, 0.4]);
}

#[test]
fn test_shade_empty_pattern_is_black() {
    let params = WeaveParameters::default();
    let isect = intersection_with([0.3, 0.3], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]);
    assert_eq!(shade(&isect, &params), [0.0; 3]);
}

#[test]
fn test_shade_plain_weave_end_to_end() {
    let mut params = pattern::plain_weave(2, 2);
    params.yarn_types[0].color = [0.4, 0.5, 0.6];
    params.finalize();
    assert!(params.specular_normalization().is_finite());
    assert!(params.specular_normalization() >= 0.0);

    for uv in [[0.25, 0.25], [0.75, 0.25], [0.25, 0.75], [0.75, 0.75]] {
        let isect = intersection_with(uv, [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]);
        let color = shade(&isect, &params);
        for channel in color {
            assert!(channel.is_finite());
            assert!(channel >= 0.0);
        }
    }

    // Diffuse-only blend: with specular strength zero and wi.z = 1 the
    // shaded color is exactly the yarn color.
    params.yarn_types[0].specular_strength = 0.0;
    let isect = intersection_with([0.25, 0.25], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]);
    assert_eq!(shade(&isect, &params), [0.4, 0.5, 0.6]);
}
