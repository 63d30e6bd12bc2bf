use rand::Rng;

/// Linear RGB triple used for dye injection. Channels are unbounded above;
/// random splats deliberately push them past 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DyeColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl DyeColor {
    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub fn scaled(self, factor: f32) -> Self {
        Self::new(self.r * factor, self.g * factor, self.b * factor)
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, 1.0]
    }
}

pub const GENERATED_BRIGHTNESS: f32 = 0.15;

pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> DyeColor {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);

    match (i as i32).rem_euclid(6) {
        0 => DyeColor::new(v, t, p),
        1 => DyeColor::new(q, v, p),
        2 => DyeColor::new(p, v, t),
        3 => DyeColor::new(p, q, v),
        4 => DyeColor::new(t, p, v),
        _ => DyeColor::new(v, p, q),
    }
}

pub fn generate_color<R: Rng + ?Sized>(rng: &mut R) -> DyeColor {
    hsv_to_rgb(rng.gen::<f32>(), 1.0, 1.0).scaled(GENERATED_BRIGHTNESS)
}

pub fn wrap(value: f32, min: f32, max: f32) -> f32 {
    let range = max - min;
    if range == 0.0 {
        return min;
    }
    let wrapped = (value - min).rem_euclid(range) + min;
    // rem_euclid can round up to exactly `range` for tiny negative inputs
    if wrapped >= max {
        min
    } else {
        wrapped
    }
}
