use std::sync::Arc;

use anyhow::ensure;
use nalgebra::Vector3;

use crate::textures::{ColorTexture, TexmapContext};

type Vec3f = Vector3<f32>;

/// One crossing of the weave grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternEntry {
    /// Whether the warp yarn is on top at this crossing.
    pub warp_above: bool,
    /// Index into the yarn-type table.
    pub yarn_type: u32,
}

/// Rectangular weave grid as supplied by a pattern loader, row major.
#[derive(Debug, Clone, Default)]
pub struct WeavePattern {
    pub width: u32,
    pub height: u32,
    /// Physical size of one pattern repeat, in scene length units.
    pub realwidth: f32,
    pub realheight: f32,
    pub entries: Vec<PatternEntry>,
}

/// Yarn family. The continuous `psi` parameter classifies the yarn
/// once, at load time, instead of being re-thresholded per evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum YarnFiber {
    Filament,
    Staple { psi: f32 },
}

impl YarnFiber {
    pub fn from_psi(psi: f32) -> Self {
        if psi <= 0.001 {
            YarnFiber::Filament
        } else {
            YarnFiber::Staple { psi }
        }
    }
}

/// Optical and geometric parameters of one yarn type.
#[derive(Debug, Clone)]
pub struct YarnType {
    /// Maximum yarn-bend half angle, radians.
    pub umax: f32,
    /// Half-width of the specular highlight window.
    pub delta_x: f32,
    /// von Mises lobe offset and concentration.
    pub alpha: f32,
    pub beta: f32,
    pub fiber: YarnFiber,
    /// Blend weight between diffuse and specular response.
    pub specular_strength: f32,
    pub color: [f32; 3],
    /// Yarn types without an explicit color fall back to yarn type 0.
    pub color_enabled: bool,
    pub color_texmap: Option<Arc<dyn ColorTexture>>,
}

impl Default for YarnType {
    fn default() -> Self {
        Self {
            umax: 0.5,
            delta_x: 0.3,
            alpha: 0.05,
            beta: 4.0,
            fiber: YarnFiber::from_psi(0.5),
            specular_strength: 0.4,
            color: [0.3, 0.3, 0.3],
            color_enabled: true,
            color_texmap: None,
        }
    }
}

/// Weave description plus shading parameters. Lifecycle: construct,
/// tweak the public fields, call [`WeaveParameters::finalize`] once,
/// then share immutably across shading threads.
#[derive(Debug, Clone)]
pub struct WeaveParameters {
    pub pattern: WeavePattern,
    pub yarn_types: Vec<YarnType>,
    pub uscale: f32,
    pub vscale: f32,
    /// Interpret uscale/vscale as tweaks on the pattern's physical size
    /// instead of direct repeat counts.
    pub realworld_uv: bool,
    /// Granularity of the hashed per-segment brightness grain; 0
    /// disables the effect.
    pub intensity_fineness: f32,
    specular_normalization: f32,
}

impl Default for WeaveParameters {
    fn default() -> Self {
        Self {
            pattern: WeavePattern::default(),
            yarn_types: Vec::new(),
            uscale: 1.0,
            vscale: 1.0,
            realworld_uv: false,
            intensity_fineness: 0.0,
            specular_normalization: 1.0,
        }
    }
}

impl WeaveParameters {
    pub fn new(pattern: WeavePattern, yarn_types: Vec<YarnType>) -> anyhow::Result<Self> {
        ensure!(
            pattern.entries.len() == (pattern.width * pattern.height) as usize,
            "pattern grid is {}x{} but holds {} entries",
            pattern.width,
            pattern.height,
            pattern.entries.len()
        );
        if !pattern.entries.is_empty() {
            ensure!(
                !yarn_types.is_empty(),
                "pattern references an empty yarn-type table"
            );
            for (i, entry) in pattern.entries.iter().enumerate() {
                ensure!(
                    (entry.yarn_type as usize) < yarn_types.len(),
                    "entry {} references yarn type {} but only {} are defined",
                    i,
                    entry.yarn_type,
                    yarn_types.len()
                );
            }
        }
        Ok(Self {
            pattern,
            yarn_types,
            ..Default::default()
        })
    }

    pub fn has_pattern(&self) -> bool {
        self.pattern.width > 0 && self.pattern.height > 0 && !self.pattern.entries.is_empty()
    }

    /// Calibrated bound on the specular peak; 1 until [`Self::finalize`]
    /// has run, 0 when calibration found no reflection at all.
    pub fn specular_normalization(&self) -> f32 {
        self.specular_normalization
    }

    /// One-time specular calibration. Must complete before `shade` is
    /// called; calling it again recomputes the same constant.
    pub fn finalize(&mut self) {
        if self.has_pattern() {
            self.specular_normalization = crate::calibration::calibrate(self);
        }
    }

    pub(crate) fn yarn(&self, index: u32) -> &YarnType {
        &self.yarn_types[index as usize]
    }
}

/// Per-sample shading input supplied by the host renderer.
#[derive(Debug, Clone, Copy)]
pub struct IntersectionData<'a> {
    /// Repeating pattern coordinates.
    pub uv: [f32; 2],
    /// Incoming and outgoing directions, unit length, in the local
    /// shading frame (z along the surface normal).
    pub wi: Vec3f,
    pub wo: Vec3f,
    pub context: TexmapContext<'a>,
}

/// Resolved yarn-segment geometry under one sample. Recomputed per
/// sample, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct PatternData {
    pub yarn_type: u32,
    /// Segment extent in grid cells, after warp/weft canonicalization.
    pub length: f32,
    pub width: f32,
    /// Position within the segment, in [-1,1]; x across the yarn, y
    /// along it.
    pub x: f32,
    pub y: f32,
    pub warp_above: bool,
    /// Yarn-local spherical angles.
    pub u: f32,
    pub v: f32,
    pub normal: Vec3f,
    /// Absolute (unwrapped) cell indices, used by intensity variation.
    pub total_index_x: u32,
    pub total_index_y: u32,
}

impl Default for PatternData {
    fn default() -> Self {
        Self {
            yarn_type: 0,
            length: 0.0,
            width: 0.0,
            x: 0.0,
            y: 0.0,
            warp_above: false,
            u: 0.0,
            v: 0.0,
            normal: Vec3f::zeros(),
            total_index_x: 0,
            total_index_y: 0,
        }
    }
}

/// Count same-dominance cells on each side of `(x, y)` along the axis
/// perpendicular to the dominant yarn (columns for warp, rows for
/// weft), wrapping at the grid edge. Stops at the first differing cell
/// or after one full loop when the whole row/column is a single yarn.
fn segment_run_lengths(pattern: &WeavePattern, x: u32, y: u32, warp_above: bool) -> (u32, u32) {
    let max_size = if warp_above {
        pattern.height
    } else {
        pattern.width
    };
    let initial = if warp_above { y } else { x };
    let dominance_at = |coord: u32| {
        let (cx, cy) = if warp_above { (x, coord) } else { (coord, y) };
        pattern.entries[(cx + cy * pattern.width) as usize].warp_above
    };

    let mut steps_right = 0;
    let mut coord = initial;
    loop {
        coord = (coord + 1) % max_size;
        if dominance_at(coord) != warp_above {
            break;
        }
        steps_right += 1;
        if coord == initial {
            break;
        }
    }

    let mut steps_left = 0;
    coord = initial;
    loop {
        coord = if coord == 0 { max_size - 1 } else { coord - 1 };
        if dominance_at(coord) != warp_above {
            break;
        }
        steps_left += 1;
        if coord == initial {
            break;
        }
    }

    (steps_left, steps_right)
}

/// Yarn-local spherical angles and segment normal for the resolved
/// position. The normal is expressed back in shading space, so for
/// weft-dominant cells the canonicalizing swap is undone.
pub(crate) fn set_segment_uv_and_normal(data: &mut PatternData, umax: f32) {
    let u = data.y * umax;
    let v = data.x * std::f32::consts::FRAC_PI_2;

    let mut normal = Vec3f::new(v.sin(), u.sin() * v.cos(), u.cos() * v.cos());
    if !data.warp_above {
        let tmp = normal.x;
        normal.x = normal.y;
        normal.y = -tmp;
    }

    data.u = u;
    data.v = v;
    data.normal = normal;
}

/// Resolve a UV sample to the yarn segment underneath it. Returns a
/// zeroed `PatternData` when no pattern is loaded; callers treat that
/// as absent cloth.
pub fn pattern_data(intersection: &IntersectionData, params: &WeaveParameters) -> PatternData {
    if !params.has_pattern() {
        return PatternData::default();
    }
    let pattern = &params.pattern;
    let [uv_x, uv_y] = intersection.uv;

    // With realworld_uv the user scales tweak the pattern's physical
    // repeat size instead of acting as direct repeat counts.
    let (u_scale, v_scale) = if params.realworld_uv {
        (
            params.uscale / pattern.realwidth,
            params.vscale / pattern.realheight,
        )
    } else {
        (params.uscale, params.vscale)
    };

    let mut u_repeat = (uv_x * u_scale) % 1.0;
    let mut v_repeat = (uv_y * v_scale) % 1.0;
    let total_x = (uv_x * u_scale * pattern.width as f32) as u32;
    let total_y = (uv_y * v_scale * pattern.height as f32) as u32;
    if u_repeat < 0.0 {
        u_repeat -= u_repeat.floor();
    }
    if v_repeat < 0.0 {
        v_repeat -= v_repeat.floor();
    }

    let pattern_x = ((u_repeat * pattern.width as f32) as u32).min(pattern.width - 1);
    let pattern_y = ((v_repeat * pattern.height as f32) as u32).min(pattern.height - 1);

    let current = pattern.entries[(pattern_x + pattern_y * pattern.width) as usize];

    let (mut steps_left_warp, mut steps_right_warp) = (0, 0);
    let (mut steps_left_weft, mut steps_right_weft) = (0, 0);
    if current.warp_above {
        (steps_left_warp, steps_right_warp) =
            segment_run_lengths(pattern, pattern_x, pattern_y, true);
    } else {
        (steps_left_weft, steps_right_weft) =
            segment_run_lengths(pattern, pattern_x, pattern_y, false);
    }

    // Yarn-segment-local coordinates.
    let mut l = (steps_left_warp + steps_right_warp) as f32 + 1.0;
    let mut y = ((v_repeat * pattern.height as f32 - pattern_y as f32) + steps_left_warp as f32) / l;
    let mut w = (steps_left_weft + steps_right_weft) as f32 + 1.0;
    let mut x = ((u_repeat * pattern.width as f32 - pattern_x as f32) + steps_left_weft as f32) / w;

    x = x * 2.0 - 1.0;
    y = y * 2.0 - 1.0;

    // Canonicalize weft-dominant cells so the yarn cylinder always
    // runs along the local y axis.
    if !current.warp_above {
        let (tmp_x, tmp_w) = (x, w);
        x = -y;
        y = tmp_x;
        w = l;
        l = tmp_w;
    }

    let mut data = PatternData {
        yarn_type: current.yarn_type,
        length: l,
        width: w,
        x,
        y,
        warp_above: current.warp_above,
        total_index_x: total_x,
        total_index_y: total_y,
        ..Default::default()
    };
    set_segment_uv_and_normal(&mut data, params.yarn(current.yarn_type).umax);
    data
}

#[cfg(test)]
pub(crate) fn plain_weave(width: u32, height: u32) -> WeaveParameters {
    let entries = (0..width * height)
        .map(|i| PatternEntry {
            warp_above: (i % width + i / width) % 2 == 0,
            yarn_type: 0,
        })
        .collect();
    let pattern = WeavePattern {
        width,
        height,
        realwidth: 1.0,
        realheight: 1.0,
        entries,
    };
    WeaveParameters::new(pattern, vec![YarnType::default()]).unwrap()
}

#[cfg(test)]
fn intersection_at(uv: [f32; 2]) -> IntersectionData<'static> {
    IntersectionData {
        uv,
        wi: Vec3f::new(0.0, 0.0, 1.0),
        wo: Vec3f::new(0.0, 0.0, 1.0),
        context: TexmapContext::default(),
    }
}

#[test]
fn test_construction_is_validated() {
    let bad_size = WeavePattern {
        width: 2,
        height: 2,
        realwidth: 1.0,
        realheight: 1.0,
        entries: vec![
            PatternEntry {
                warp_above: true,
                yarn_type: 0,
            };
            3
        ],
    };
    assert!(WeaveParameters::new(bad_size, vec![YarnType::default()]).is_err());

    let bad_index = WeavePattern {
        width: 1,
        height: 1,
        realwidth: 1.0,
        realheight: 1.0,
        entries: vec![PatternEntry {
            warp_above: true,
            yarn_type: 3,
        }],
    };
    assert!(WeaveParameters::new(bad_index, vec![YarnType::default()]).is_err());
}

#[test]
fn test_pattern_data_stays_in_range() {
    use rand::Rng;
    let params = plain_weave(4, 3);
    let mut rng = rand::thread_rng();
    for _ in 0..2000 {
        let uv = [rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0)];
        let data = pattern_data(&intersection_at(uv), &params);
        assert!((-1.0..=1.0).contains(&data.x), "x = {}", data.x);
        assert!((-1.0..=1.0).contains(&data.y), "y = {}", data.y);
        assert!(data.length >= 1.0);
        assert!(data.width >= 1.0);
        assert!((data.normal.norm() - 1.0).abs() < 1.0e-4);
    }
}

#[test]
fn test_pattern_tiles() {
    let params = plain_weave(2, 2);
    for (u, v) in [(0.1, 0.3), (0.6, 0.85), (0.33, 0.71)] {
        let a = pattern_data(&intersection_at([u, v]), &params);
        let b = pattern_data(&intersection_at([u + 1.0, v]), &params);
        let c = pattern_data(&intersection_at([u, v + 1.0]), &params);
        for other in [b, c] {
            assert_eq!(a.yarn_type, other.yarn_type);
            assert_eq!(a.warp_above, other.warp_above);
            assert_eq!(a.length, other.length);
            assert_eq!(a.width, other.width);
            assert!((a.x - other.x).abs() < 1.0e-4);
            assert!((a.y - other.y).abs() < 1.0e-4);
        }
    }
}

#[test]
fn test_scanner_wraps_a_uniform_row() {
    // A row that is one long weft float: both scan directions walk the
    // whole row before stopping at the starting cell.
    let pattern = WeavePattern {
        width: 4,
        height: 1,
        realwidth: 1.0,
        realheight: 1.0,
        entries: vec![
            PatternEntry {
                warp_above: false,
                yarn_type: 0,
            };
            4
        ],
    };
    assert_eq!(segment_run_lengths(&pattern, 0, 0, false), (4, 4));

    let pattern = WeavePattern {
        width: 1,
        height: 5,
        realwidth: 1.0,
        realheight: 1.0,
        entries: vec![
            PatternEntry {
                warp_above: true,
                yarn_type: 0,
            };
            5
        ],
    };
    assert_eq!(segment_run_lengths(&pattern, 0, 0, true), (5, 5));
}

#[test]
fn test_scanner_stops_at_crossings() {
    // Plain weave alternates every cell, so every segment is one cell.
    let params = plain_weave(2, 2);
    assert_eq!(segment_run_lengths(&params.pattern, 0, 0, true), (0, 0));
    assert_eq!(segment_run_lengths(&params.pattern, 1, 0, false), (0, 0));
}

#[test]
fn test_resolver_identifies_cells() {
    let params = plain_weave(2, 2);
    // Cell centers of the 2x2 repeat.
    let expect = [
        ([0.25, 0.25], true),
        ([0.75, 0.25], false),
        ([0.25, 0.75], false),
        ([0.75, 0.75], true),
    ];
    for (uv, warp_above) in expect {
        let data = pattern_data(&intersection_at(uv), &params);
        assert_eq!(data.warp_above, warp_above, "uv = {uv:?}");
    }
}

#[test]
fn test_empty_pattern_resolves_to_nothing() {
    let params = WeaveParameters::default();
    assert!(!params.has_pattern());
    let data = pattern_data(&intersection_at([0.4, 0.6]), &params);
    assert_eq!(data.length, 0.0);
    assert_eq!(data.width, 0.0);
    assert_eq!(data.yarn_type, 0);
}
