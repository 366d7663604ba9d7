use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, PI};

// largest float number less than 1
pub const ONE_MINUS_EPSILON: f64 = 1.0 - f64::EPSILON;

pub fn radical_inverse<Real>(mut a: usize, base: usize) -> Real
where
    Real: num_traits::Float,
{
    // base must be a prime number
    let inv_base = (Real::one()) / (Real::from(base).unwrap());
    let mut inv_base_m = Real::one();
    //reversed digits:
    let mut rev_digits: usize = 0;
    while a != 0 {
        let next: usize = a / base;
        // least significant digit
        let digit: usize = a - next * base;
        rev_digits = rev_digits * base + digit;
        inv_base_m = inv_base_m * inv_base;
        a = next;
    }
    // can be expressed as (d_1*b^(m-1) + d_2*b^(m-2) ... + d_m*b^0 )/b^(m)
    let inv = Real::from(rev_digits).unwrap() * inv_base_m;
    Real::min(inv, Real::from(ONE_MINUS_EPSILON).unwrap())
}

/// The n-th point of the 4D Halton sequence (bases 2, 3, 5, 7).
pub fn halton_4(n: usize) -> [f32; 4] {
    [
        radical_inverse(n, 2),
        radical_inverse(n, 3),
        radical_inverse(n, 5),
        radical_inverse(n, 7),
    ]
}

/// Cosine-weighted hemisphere direction, z up.
/// Concentric disk mapping with reduced branching (Dave Cline's variant).
pub fn hemisphere_zup_cos_weighted(r2: &[f32; 2]) -> [f32; 3] {
    let s = 2.0 * r2[0] - 1.0;
    let t = 2.0 * r2[1] - 1.0;
    let (r, phi) = if s == 0.0 && t == 0.0 {
        (0.0, 0.0)
    } else if s * s > t * t {
        (s, FRAC_PI_4 * (t / s))
    } else {
        (t, FRAC_PI_2 - (s / t) * FRAC_PI_4)
    };
    let x = r * phi.cos();
    let y = r * phi.sin();
    let z = (1.0 - x * x - y * y).max(0.0).sqrt();
    [x, y, z]
}

/// Hemisphere direction from two uniforms via spherical angles, z up.
pub fn hemisphere_zup_uniform(r2: &[f32; 2]) -> [f32; 3] {
    let theta = 2.0 * PI * r2[0];
    let phi = (2.0 * r2[1] - 1.0).acos();
    [
        theta.cos() * phi.cos(),
        theta.sin() * phi.cos(),
        phi.sin(),
    ]
}

/// Tiny Encryption Algorithm by David Wheeler and Roger Needham,
/// used as a keyed mixing hash of two 32-bit values.
pub fn sample_tea(mut v0: u32, mut v1: u32, rounds: u32) -> u64 {
    let mut sum: u32 = 0;
    for _ in 0..rounds {
        sum = sum.wrapping_add(0x9e37_79b9);
        v0 = v0.wrapping_add(
            (v1 << 4).wrapping_add(0xa341_316c)
                ^ v1.wrapping_add(sum)
                ^ (v1 >> 5).wrapping_add(0xc801_3ea4),
        );
        v1 = v1.wrapping_add(
            (v0 << 4).wrapping_add(0xad90_777d)
                ^ v0.wrapping_add(sum)
                ^ (v0 >> 5).wrapping_add(0x7e95_761e),
        );
    }
    ((v1 as u64) << 32) | v0 as u64
}

/// Uniform value in [0,1) derived from the hash: place the low bits in
/// the mantissa of a float in [1,2), then subtract 1.
pub fn sample_tea_float(v0: u32, v1: u32, rounds: u32) -> f32 {
    let bits = ((sample_tea(v0, v1, rounds) & 0xffff_ffff) as u32 >> 9) | 0x3f80_0000;
    f32::from_bits(bits) - 1.0
}

#[test]
fn test_radical_inverse() {
    assert_eq!(radical_inverse::<f32>(0, 2), 0.0);
    assert_eq!(radical_inverse::<f32>(1, 2), 0.5);
    assert_eq!(radical_inverse::<f32>(2, 2), 0.25);
    assert_eq!(radical_inverse::<f32>(3, 2), 0.75);
    assert_eq!(radical_inverse::<f32>(1, 3), 1.0 / 3.0);
    for n in 0..500 {
        for v in halton_4(n) {
            assert!((0.0..1.0).contains(&v));
        }
    }
}

#[test]
fn test_hemisphere_directions() {
    for i in 0..32 {
        for j in 0..32 {
            let r2 = [(i as f32 + 0.5) / 32.0, (j as f32 + 0.5) / 32.0];
            for d in [hemisphere_zup_cos_weighted(&r2), hemisphere_zup_uniform(&r2)] {
                let norm = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                assert!((norm - 1.0).abs() < 1.0e-4);
                assert!(d[2] >= 0.0);
            }
        }
    }
}

#[test]
fn test_tea_hash() {
    for v0 in 0..64u32 {
        for v1 in 0..64u32 {
            let a = sample_tea_float(v0, v1, 8);
            let b = sample_tea_float(v0, v1, 8);
            assert_eq!(a, b);
            assert!((0.0..1.0).contains(&a));
        }
    }
    assert_ne!(sample_tea(1, 2, 8), sample_tea(2, 1, 8));
    assert_ne!(sample_tea(0, 0, 8), sample_tea(0, 1, 8));
}
