//! Volumetric scalar fields and the handful of image-algebra primitives the
//! pipeline is built from: separable FIR convolution, voxel-wise subtraction,
//! 2x nearest decimation and central-difference gradients.
//!
//! Voxels live on an integer lattice; the continuous center of voxel
//! `(x, y, z)` is `(x + 0.5, y + 0.5, z + 0.5)`. Unit isotropic spacing is
//! assumed at pyramid level 0.

use nalgebra::Vector3;
use ndarray::{Array4, Zip};

/// A 3D image with `nc` channels and a scale attribute recording the total
/// Gaussian blur applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array4<f32>,
    scale: f64,
}

impl Volume {
    /// New zero-filled volume.
    pub fn zeros(nx: usize, ny: usize, nz: usize, nc: usize) -> Self {
        assert!(nc >= 1);
        Self {
            data: Array4::zeros((nx, ny, nz, nc)),
            scale: 0.0,
        }
    }

    /// Build a single-channel volume from a flat buffer in x-major order
    /// (x varies slowest, matching the `(x, y, z)` index order used here).
    pub fn from_raw(nx: usize, ny: usize, nz: usize, data: Vec<f32>) -> Self {
        let data = Array4::from_shape_vec((nx, ny, nz, 1), data)
            .expect("buffer length must equal nx * ny * nz");
        Self { data, scale: 0.0 }
    }

    /// Fill a single-channel volume from a function of the voxel index.
    pub fn from_fn(
        nx: usize,
        ny: usize,
        nz: usize,
        mut f: impl FnMut(usize, usize, usize) -> f32,
    ) -> Self {
        Self {
            data: Array4::from_shape_fn((nx, ny, nz, 1), |(x, y, z, _)| f(x, y, z)),
            scale: 0.0,
        }
    }

    pub fn nx(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn ny(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn nz(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn nc(&self) -> usize {
        self.data.shape()[3]
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.nx(), self.ny(), self.nz())
    }

    /// Total Gaussian blur applied to this volume.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize, c: usize) -> f32 {
        self.data[[x, y, z, c]]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, c: usize, v: f32) {
        self.data[[x, y, z, c]] = v;
    }

    /// Channel-0 sample.
    #[inline]
    pub fn at(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[[x, y, z, 0]]
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    /// Maximum absolute voxel value over all channels.
    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }

    /// Central-difference gradient of channel 0 at an interior voxel.
    ///
    /// Callers must keep `1 <= x <= nx - 2` (same for y, z).
    #[inline]
    pub fn gradient(&self, x: usize, y: usize, z: usize) -> Vector3<f64> {
        debug_assert!(x >= 1 && x <= self.nx() - 2);
        debug_assert!(y >= 1 && y <= self.ny() - 2);
        debug_assert!(z >= 1 && z <= self.nz() - 2);
        Vector3::new(
            0.5 * (self.at(x + 1, y, z) - self.at(x - 1, y, z)) as f64,
            0.5 * (self.at(x, y + 1, z) - self.at(x, y - 1, z)) as f64,
            0.5 * (self.at(x, y, z + 1) - self.at(x, y, z - 1)) as f64,
        )
    }
}

/// Symmetric 1D Gaussian kernel, unit sum, half-width `ceil(3 sigma)`.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianKernel {
    sigma: f64,
    taps: Vec<f32>,
}

impl GaussianKernel {
    pub fn new(sigma: f64) -> Self {
        assert!(sigma >= 0.0);
        if sigma == 0.0 {
            return Self {
                sigma,
                taps: vec![1.0],
            };
        }
        let half_width = (3.0 * sigma).ceil().max(1.0) as usize;
        let mut taps: Vec<f64> = (0..2 * half_width + 1)
            .map(|i| {
                let r = i as f64 - half_width as f64;
                (-0.5 * r * r / (sigma * sigma)).exp()
            })
            .collect();
        let sum: f64 = taps.iter().sum();
        taps.iter_mut().for_each(|t| *t /= sum);
        Self {
            sigma,
            taps: taps.into_iter().map(|t| t as f32).collect(),
        }
    }

    /// Kernel taking an image at blur level `from` to blur level `to`,
    /// additive in variance.
    pub fn incremental(from: f64, to: f64) -> Self {
        assert!(
            to >= from,
            "cannot sharpen: from = {from}, to = {to}"
        );
        Self::new((to * to - from * from).sqrt())
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn taps(&self) -> &[f32] {
        &self.taps
    }
}

/// Separable FIR convolution over each spatial axis of every channel.
/// Border samples clamp to the volume extents.
pub fn apply_sep_fir(src: &Volume, kernel: &GaussianKernel) -> Volume {
    let taps = kernel.taps();
    if taps.len() == 1 {
        return src.clone();
    }
    let half = taps.len() / 2;
    let (nx, ny, nz) = src.dims();
    let nc = src.nc();

    let mut cur = src.data.clone();
    let mut next = Array4::zeros((nx, ny, nz, nc));

    // One pass per axis, ping-ponging between the two buffers.
    for axis in 0..3 {
        let n = [nx, ny, nz][axis];
        for x in 0..nx {
            for y in 0..ny {
                for z in 0..nz {
                    for c in 0..nc {
                        let pos = [x, y, z][axis];
                        let mut acc = 0.0f32;
                        for (k, t) in taps.iter().enumerate() {
                            let p = (pos as isize + k as isize - half as isize)
                                .clamp(0, n as isize - 1) as usize;
                            let mut idx = [x, y, z];
                            idx[axis] = p;
                            acc += t * cur[[idx[0], idx[1], idx[2], c]];
                        }
                        next[[x, y, z, c]] = acc;
                    }
                }
            }
        }
        std::mem::swap(&mut cur, &mut next);
    }

    Volume {
        data: cur,
        scale: src.scale,
    }
}

/// Voxel-wise difference `a - b`. Both volumes must share dimensions.
pub fn subtract(a: &Volume, b: &Volume) -> Volume {
    assert_eq!(a.data.shape(), b.data.shape());
    let mut data = Array4::zeros(a.data.raw_dim());
    Zip::from(&mut data)
        .and(&a.data)
        .and(&b.data)
        .for_each(|d, &x, &y| *d = x - y);
    Volume {
        data,
        scale: a.scale,
    }
}

/// 2x decimation keeping every second sample, nearest neighbor.
pub fn downsample_2x(src: &Volume) -> Volume {
    let (nx, ny, nz) = src.dims();
    let nc = src.nc();
    let (dx, dy, dz) = (nx / 2, ny / 2, nz / 2);
    assert!(dx >= 1 && dy >= 1 && dz >= 1);
    let data = Array4::from_shape_fn((dx, dy, dz, nc), |(x, y, z, c)| {
        src.data[[2 * x, 2 * y, 2 * z, c]]
    });
    Volume {
        data,
        scale: src.scale,
    }
}

/// Visit every interior voxel inside the sphere of radius `rad` around
/// `center` (continuous coordinates). The callback receives the voxel index,
/// the displacement of the voxel center from `center`, and its squared norm.
pub(crate) fn for_each_sphere(
    vol: &Volume,
    center: Vector3<f64>,
    rad: f64,
    mut f: impl FnMut(usize, usize, usize, Vector3<f64>, f64),
) {
    let (nx, ny, nz) = vol.dims();
    let r = (rad + 0.5) as i64;
    let x_start = (center.x as i64 - r).max(1);
    let x_end = (center.x as i64 + r).min(nx as i64 - 2);
    let y_start = (center.y as i64 - r).max(1);
    let y_end = (center.y as i64 + r).min(ny as i64 - 2);
    let z_start = (center.z as i64 - r).max(1);
    let z_end = (center.z as i64 + r).min(nz as i64 - 2);

    for z in z_start..=z_end {
        for y in y_start..=y_end {
            for x in x_start..=x_end {
                let disp = Vector3::new(
                    x as f64 + 0.5 - center.x,
                    y as f64 + 0.5 - center.y,
                    z as f64 + 0.5 - center.z,
                );
                let sq_dist = disp.norm_squared();
                if sq_dist > rad * rad {
                    continue;
                }
                f(x as usize, y as usize, z as usize, disp, sq_dist);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn gaussian_kernel_sums_to_one() {
        for sigma in [0.3, 0.8, 1.6, 3.2] {
            let k = GaussianKernel::new(sigma);
            let sum: f32 = k.taps().iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-6);
            assert_eq!(k.taps().len() % 2, 1);
        }
    }

    #[test]
    fn zero_sigma_kernel_is_identity() {
        let im = Volume::from_fn(4, 4, 4, |x, y, z| (x + 2 * y + 4 * z) as f32);
        let out = apply_sep_fir(&im, &GaussianKernel::new(0.0));
        assert_eq!(im, out);
    }

    #[test]
    fn blur_preserves_constant_volume() {
        let im = Volume::from_fn(8, 8, 8, |_, _, _| 3.5);
        let out = apply_sep_fir(&im, &GaussianKernel::new(1.2));
        for v in out.data().iter() {
            assert_relative_eq!(*v, 3.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn incremental_blurs_compose() {
        // sigma_a followed by sqrt(sigma_b^2 - sigma_a^2) matches a direct
        // sigma_b blur up to convolution error.
        let im = Volume::from_fn(24, 24, 24, |x, y, z| {
            if (x, y, z) == (12, 12, 12) {
                1.0
            } else {
                0.0
            }
        });
        let a = apply_sep_fir(&im, &GaussianKernel::new(1.0));
        let ab = apply_sep_fir(&a, &GaussianKernel::incremental(1.0, 1.8));
        let direct = apply_sep_fir(&im, &GaussianKernel::new(1.8));
        for (u, v) in ab.data().iter().zip(direct.data().iter()) {
            assert_relative_eq!(u, v, epsilon = 1e-4);
        }
    }

    #[test]
    fn subtract_is_voxelwise() {
        let a = Volume::from_fn(3, 3, 3, |x, _, _| x as f32);
        let b = Volume::from_fn(3, 3, 3, |_, y, _| y as f32);
        let d = subtract(&a, &b);
        assert_eq!(d.at(2, 1, 0), 1.0);
        assert_eq!(d.at(0, 2, 0), -2.0);
    }

    #[test]
    fn downsample_keeps_even_samples() {
        let im = Volume::from_fn(6, 6, 6, |x, y, z| (100 * x + 10 * y + z) as f32);
        let down = downsample_2x(&im);
        assert_eq!(down.dims(), (3, 3, 3));
        assert_eq!(down.at(1, 2, 0), im.at(2, 4, 0));
    }

    #[test]
    fn gradient_of_linear_ramp() {
        let im = Volume::from_fn(5, 5, 5, |x, y, z| (2 * x + 3 * y + 4 * z) as f32);
        let g = im.gradient(2, 2, 2);
        assert_relative_eq!(g.x, 2.0, epsilon = 1e-6);
        assert_relative_eq!(g.y, 3.0, epsilon = 1e-6);
        assert_relative_eq!(g.z, 4.0, epsilon = 1e-6);
    }

    #[test]
    fn sphere_window_stays_interior() {
        let im = Volume::zeros(8, 8, 8, 1);
        let mut count = 0;
        for_each_sphere(&im, Vector3::new(4.0, 4.0, 4.0), 10.0, |x, y, z, _, _| {
            assert!((1..=6).contains(&x));
            assert!((1..=6).contains(&y));
            assert!((1..=6).contains(&z));
            count += 1;
        });
        assert_eq!(count, 6 * 6 * 6);
    }
}
