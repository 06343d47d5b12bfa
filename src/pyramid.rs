//! Gaussian scale-space and difference-of-Gaussians pyramids.
//!
//! A pyramid is a 2D grid of volumes indexed by `(octave, level)`. Levels
//! run from `FIRST_LEVEL = -1`; the Gaussian pyramid has `num_kp_levels + 3`
//! levels per octave and the DoG one fewer. The scale assigned to level `s`
//! of octave `o` is `sigma0 * 2^(o + s / num_kp_levels)`.

use log::debug;

use crate::volume::{apply_sep_fir, downsample_2x, subtract, GaussianKernel, Volume};

/// Index of the lowest level in every octave.
pub const FIRST_LEVEL: i32 = -1;

/// Shape and blur parameters shared by both pyramid variants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidParams {
    pub first_octave: i32,
    pub num_octaves: usize,
    pub num_kp_levels: usize,
    pub sigma0: f64,
    pub sigma_n: f64,
}

impl PyramidParams {
    pub fn last_octave(&self) -> i32 {
        self.first_octave + self.num_octaves as i32 - 1
    }

    /// Blur level of `(o, s)` in base-octave units.
    pub fn sigma(&self, o: i32, s: i32) -> f64 {
        self.sigma0 * 2f64.powf(o as f64 + s as f64 / self.num_kp_levels as f64)
    }
}

/// Precomputed 1D Gaussian kernels for one pyramid shape.
///
/// `first` takes the input data from its nominal blur `sigma_n` to the blur
/// of the base level; `per_level[i]` takes level `s - 1` to level `s` and is
/// valid for every octave because blur increments are scale-invariant on the
/// octave grid.
#[derive(Debug, Clone)]
pub struct GssFilters {
    first: GaussianKernel,
    per_level: Vec<GaussianKernel>,
}

impl GssFilters {
    pub fn new(p: &PyramidParams) -> Self {
        let num_levels = p.num_kp_levels + 3;
        let base_sigma = p.sigma(p.first_octave, FIRST_LEVEL);
        let first = GaussianKernel::incremental(p.sigma_n, base_sigma);
        let per_level = (FIRST_LEVEL + 1..FIRST_LEVEL + num_levels as i32)
            .map(|s| GaussianKernel::incremental(p.sigma(0, s - 1), p.sigma(0, s)))
            .collect();
        Self { first, per_level }
    }

    fn level_kernel(&self, s: i32) -> &GaussianKernel {
        &self.per_level[(s - FIRST_LEVEL - 1) as usize]
    }
}

/// A 2D grid of volumes indexed by `(octave, level)`.
#[derive(Debug, Clone)]
pub struct Pyramid {
    levels: Vec<Volume>,
    first_octave: i32,
    num_octaves: usize,
    num_levels: usize,
    num_kp_levels: usize,
    sigma0: f64,
}

impl Pyramid {
    /// Build the Gaussian scale space of `im`.
    ///
    /// The base level of the first octave is `im` blurred from `sigma_n`;
    /// each level after that blurs the previous one incrementally, and every
    /// subsequent octave starts from a 2x decimation of the level of the
    /// previous octave whose blur matches its base level.
    pub fn build_gaussian(im: &Volume, p: &PyramidParams, gss: &GssFilters) -> Self {
        let num_levels = p.num_kp_levels + 3;
        let last_level = FIRST_LEVEL + num_levels as i32 - 1;
        // The level of octave o whose sigma equals 2x the base level's.
        let seed_level = FIRST_LEVEL + p.num_kp_levels as i32;

        let mut levels = Vec::with_capacity(p.num_octaves * num_levels);
        for o in p.first_octave..=p.last_octave() {
            let mut base = if o == p.first_octave {
                apply_sep_fir(im, &gss.first)
            } else {
                let prev_octave_start = levels.len() - num_levels;
                downsample_2x(&levels[prev_octave_start + (seed_level - FIRST_LEVEL) as usize])
            };
            base.set_scale(p.sigma(o, FIRST_LEVEL));
            levels.push(base);

            for s in FIRST_LEVEL + 1..=last_level {
                let prev = levels.last().expect("base level pushed above");
                let mut cur = apply_sep_fir(prev, gss.level_kernel(s));
                cur.set_scale(p.sigma(o, s));
                levels.push(cur);
            }
        }

        debug!(
            "built Gaussian pyramid: {} octaves x {} levels, base {:?}",
            p.num_octaves,
            num_levels,
            im.dims()
        );

        Self {
            levels,
            first_octave: p.first_octave,
            num_octaves: p.num_octaves,
            num_levels,
            num_kp_levels: p.num_kp_levels,
            sigma0: p.sigma0,
        }
    }

    /// Difference-of-Gaussians pyramid: `dog[o][s] = gpyr[o][s+1] - gpyr[o][s]`.
    pub fn build_dog(gpyr: &Pyramid) -> Self {
        let num_levels = gpyr.num_levels - 1;
        let mut levels = Vec::with_capacity(gpyr.num_octaves * num_levels);
        for o in gpyr.first_octave()..=gpyr.last_octave() {
            for s in FIRST_LEVEL..FIRST_LEVEL + num_levels as i32 {
                let mut level = subtract(gpyr.level(o, s + 1), gpyr.level(o, s));
                level.set_scale(gpyr.level(o, s).scale());
                levels.push(level);
            }
        }
        Self {
            levels,
            first_octave: gpyr.first_octave,
            num_octaves: gpyr.num_octaves,
            num_levels,
            num_kp_levels: gpyr.num_kp_levels,
            sigma0: gpyr.sigma0,
        }
    }

    pub fn level(&self, o: i32, s: i32) -> &Volume {
        let oi = (o - self.first_octave) as usize;
        let si = (s - FIRST_LEVEL) as usize;
        assert!(oi < self.num_octaves && si < self.num_levels);
        &self.levels[oi * self.num_levels + si]
    }

    pub fn first_octave(&self) -> i32 {
        self.first_octave
    }

    pub fn last_octave(&self) -> i32 {
        self.first_octave + self.num_octaves as i32 - 1
    }

    pub fn num_octaves(&self) -> usize {
        self.num_octaves
    }

    pub fn first_level(&self) -> i32 {
        FIRST_LEVEL
    }

    pub fn last_level(&self) -> i32 {
        FIRST_LEVEL + self.num_levels as i32 - 1
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    pub fn num_kp_levels(&self) -> usize {
        self.num_kp_levels
    }
}
