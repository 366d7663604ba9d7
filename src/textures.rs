use std::any::Any;

/// Opaque renderer state, handed through to texture lookups untouched.
#[derive(Clone, Copy, Default)]
pub struct TexmapContext<'a> {
    pub data: Option<&'a (dyn Any + Sync)>,
}

impl std::fmt::Debug for TexmapContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TexmapContext")
            .field("data", &self.data.is_some())
            .finish()
    }
}

/// Per-yarn diffuse color source resolved by the host renderer.
pub trait ColorTexture: std::fmt::Debug + Send + Sync {
    fn eval_color(&self, context: &TexmapContext) -> [f32; 3];
}

#[derive(Debug)]
pub struct ConstantTexture(pub [f32; 3]);

impl ColorTexture for ConstantTexture {
    fn eval_color(&self, _context: &TexmapContext) -> [f32; 3] {
        self.0
    }
}

#[test]
fn test_constant_texture() {
    let tex = ConstantTexture([0.9, 0.5, 0.1]);
    assert_eq!(tex.eval_color(&TexmapContext::default()), [0.9, 0.5, 0.1]);
}
