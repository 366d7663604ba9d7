pub mod brdf;
pub mod calibration;
pub mod pattern;
pub mod sampling;
pub mod textures;

pub use brdf::{shade, Color};
pub use pattern::{
    IntersectionData, PatternData, PatternEntry, WeaveParameters, WeavePattern, YarnFiber, YarnType,
};
pub use textures::{ColorTexture, TexmapContext};
