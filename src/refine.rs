//! Sub-voxel refinement of keypoint candidates.
//!
//! Scale-space extrema are found on the discrete voxel grid, but the DoG
//! function they sample is continuous; the true extremum rarely falls on a
//! sample point. Each candidate is therefore iterated towards the continuous
//! extremum, with the position clamped to the interior of its level and the
//! scale clamped to the neighboring levels.

use log::debug;
use nalgebra::{Matrix4, Vector4};

use crate::keypoint::Keypoint;
use crate::pyramid::Pyramid;
use crate::volume::Volume;
use crate::RefineMethod;

const MAX_REFINE_ITERS: usize = 5;

/// Per-axis offset of the interpolating parabola through `(minus, center,
/// plus)`. The denominator matches the historical form of this detector; it
/// is not the textbook quadratic-fit curvature.
#[inline]
fn parabola_offset(minus: f32, center: f32, plus: f32) -> f64 {
    -0.5 * (plus - minus) as f64 / (plus - minus + 2.0 * center) as f64
}

fn parabolic_step(
    prev: &Volume,
    cur: &Volume,
    next: &Volume,
    x: usize,
    y: usize,
    z: usize,
) -> Vector4<f64> {
    Vector4::new(
        parabola_offset(cur.at(x - 1, y, z), cur.at(x, y, z), cur.at(x + 1, y, z)),
        parabola_offset(cur.at(x, y - 1, z), cur.at(x, y, z), cur.at(x, y + 1, z)),
        parabola_offset(cur.at(x, y, z - 1), cur.at(x, y, z), cur.at(x, y, z + 1)),
        parabola_offset(prev.at(x, y, z), cur.at(x, y, z), next.at(x, y, z)),
    )
}

/// Newton step on the 4D scale-space quadric: solve `H dx = -g` where `H`
/// includes the mixed space-scale derivatives estimated from the adjacent
/// DoG levels. Returns `None` when the system is singular.
fn newton_step(
    prev: &Volume,
    cur: &Volume,
    next: &Volume,
    x: usize,
    y: usize,
    z: usize,
) -> Option<Vector4<f64>> {
    let g = cur.gradient(x, y, z);
    let ds = 0.5 * (next.at(x, y, z) - prev.at(x, y, z)) as f64;
    let b = Vector4::new(-g.x, -g.y, -g.z, -ds);

    let c2 = 2.0 * cur.at(x, y, z) as f64;
    let dxx = (cur.at(x + 1, y, z) + cur.at(x - 1, y, z)) as f64 - c2;
    let dyy = (cur.at(x, y + 1, z) + cur.at(x, y - 1, z)) as f64 - c2;
    let dzz = (cur.at(x, y, z + 1) + cur.at(x, y, z - 1)) as f64 - c2;
    let dxy = 0.25
        * (cur.at(x + 1, y + 1, z) - cur.at(x + 1, y - 1, z) - cur.at(x - 1, y + 1, z)
            + cur.at(x - 1, y - 1, z)) as f64;
    let dxz = 0.25
        * (cur.at(x + 1, y, z + 1) - cur.at(x + 1, y, z - 1) - cur.at(x - 1, y, z + 1)
            + cur.at(x - 1, y, z - 1)) as f64;
    let dyz = 0.25
        * (cur.at(x, y + 1, z + 1) - cur.at(x, y + 1, z - 1) - cur.at(x, y - 1, z + 1)
            + cur.at(x, y - 1, z - 1)) as f64;
    let dxs = 0.25
        * (next.at(x + 1, y, z) - prev.at(x + 1, y, z) + prev.at(x - 1, y, z)
            - next.at(x - 1, y, z)) as f64;
    let dys = 0.25
        * (next.at(x, y + 1, z) - prev.at(x, y + 1, z) + prev.at(x, y - 1, z)
            - next.at(x, y - 1, z)) as f64;
    let dzs = 0.25
        * (next.at(x, y, z + 1) - prev.at(x, y, z + 1) + prev.at(x, y, z - 1)
            - next.at(x, y, z - 1)) as f64;
    let dss = 0.25 * (next.at(x, y, z) as f64 - c2 + prev.at(x, y, z) as f64);

    #[rustfmt::skip]
    let h = Matrix4::new(
        dxx, dxy, dxz, dxs,
        dxy, dyy, dyz, dys,
        dxz, dyz, dzz, dzs,
        dxs, dys, dzs, dss,
    );
    h.lu().solve(&b)
}

/// Refine every candidate in place. Candidates are never rejected here; a
/// singular Newton system simply accepts the current estimate.
pub(crate) fn refine_keypoints(dog: &Pyramid, keypoints: &mut [Keypoint], method: RefineMethod) {
    for key in keypoints.iter_mut() {
        let prev = dog.level(key.o, key.s - 1);
        let cur = dog.level(key.o, key.s);
        let next = dog.level(key.o, key.s + 1);

        let (nx, ny, nz) = cur.dims();
        let xmax = (nx - 2) as f64 - f64::EPSILON;
        let ymax = (ny - 2) as f64 - f64::EPSILON;
        let zmax = (nz - 2) as f64 - f64::EPSILON;
        let smin = prev.scale();
        let smax = next.scale();

        let (mut x, mut y, mut z) = (key.xi, key.yi, key.zi);
        let mut xd = x as f64 + 0.5;
        let mut yd = y as f64 + 0.5;
        let mut zd = z as f64 + 0.5;
        let mut sd = cur.scale();

        for _ in 0..MAX_REFINE_ITERS {
            debug_assert!(x >= 1 && y >= 1 && z >= 1);
            debug_assert!(x <= nx - 2 && y <= ny - 2 && z <= nz - 2);

            let step = match method {
                RefineMethod::Parabolic => parabolic_step(prev, cur, next, x, y, z),
                RefineMethod::Newton => match newton_step(prev, cur, next, x, y, z) {
                    Some(step) => step,
                    None => break,
                },
            };

            xd = (xd + step.x).min(xmax).max(1.0);
            yd = (yd + step.y).min(ymax).max(1.0);
            zd = (zd + step.z).min(zmax).max(1.0);
            sd = (sd + step.w).min(smax).max(smin);

            let xn = xd.floor() as usize;
            let yn = yd.floor() as usize;
            let zn = zd.floor() as usize;
            if (xn, yn, zn) == (x, y, z) {
                break;
            }
            (x, y, z) = (xn, yn, zn);
        }

        key.xi = x;
        key.yi = y;
        key.zi = z;
        key.xd = xd;
        key.yd = yd;
        key.zd = zd;
        key.sd = sd;
        key.sd_rel = sd * 2f64.powi(-key.o);
    }

    debug!("refined {} keypoints", keypoints.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_extrema::detect_extrema;
    use crate::pyramid::{GssFilters, PyramidParams};
    use crate::volume::Volume;
    use crate::ExtremaMode;

    fn blob_scene(n: usize, cx: f64, cy: f64, cz: f64) -> Volume {
        Volume::from_fn(n, n, n, |x, y, z| {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            let dz = z as f64 + 0.5 - cz;
            (-(dx * dx + dy * dy + dz * dz) / (2.0 * 9.0)).exp() as f32
        })
    }

    fn refined_for(im: &Volume, method: RefineMethod) -> Vec<Keypoint> {
        let p = PyramidParams {
            first_octave: 0,
            num_octaves: 2,
            num_kp_levels: 3,
            sigma0: 1.6,
            sigma_n: 1.15,
        };
        let gpyr = Pyramid::build_gaussian(im, &p, &GssFilters::new(&p));
        let dog = Pyramid::build_dog(&gpyr);
        let mut kps = detect_extrema(&dog, 0.03, ExtremaMode::FaceConnected).unwrap();
        refine_keypoints(&dog, &mut kps, method);
        kps
    }

    #[test]
    fn refined_positions_stay_in_bounds() {
        let im = blob_scene(48, 24.5, 24.5, 24.5);
        for method in [RefineMethod::Parabolic, RefineMethod::Newton] {
            let kps = refined_for(&im, method);
            assert!(!kps.is_empty());
            for kp in &kps {
                let n = 48usize >> kp.o;
                assert!(kp.xi >= 1 && kp.xi <= n - 2);
                assert!(kp.yi >= 1 && kp.yi <= n - 2);
                assert!(kp.zi >= 1 && kp.zi <= n - 2);
                assert_eq!(kp.xi, kp.xd.floor() as usize);
                assert!(kp.xd >= 1.0 && kp.xd <= (n - 2) as f64);
            }
        }
    }

    #[test]
    fn refined_scale_is_bracketed_by_neighbor_levels() {
        let im = blob_scene(48, 24.5, 24.5, 24.5);
        let p = PyramidParams {
            first_octave: 0,
            num_octaves: 2,
            num_kp_levels: 3,
            sigma0: 1.6,
            sigma_n: 1.15,
        };
        for kp in refined_for(&im, RefineMethod::Parabolic) {
            let lo = p.sigma(kp.o, kp.s - 1);
            let hi = p.sigma(kp.o, kp.s + 1);
            assert!(kp.sd >= lo && kp.sd <= hi, "sd {} not in [{lo}, {hi}]", kp.sd);
            assert!((kp.sd_rel - kp.sd * 2f64.powi(-kp.o)).abs() < 1e-12);
        }
    }

    #[test]
    fn centered_blob_refines_to_its_center() {
        // Blob centered exactly on a voxel center; refinement should stay put.
        let im = blob_scene(48, 24.5, 24.5, 24.5);
        let kps = refined_for(&im, RefineMethod::Parabolic);
        let near = kps
            .iter()
            .filter(|k| {
                let f = k.coord_factor();
                let d = ((k.xd * f - 24.5).powi(2)
                    + (k.yd * f - 24.5).powi(2)
                    + (k.zd * f - 24.5).powi(2))
                .sqrt();
                d <= 1.0
            })
            .count();
        assert_eq!(near, 1);
    }

    #[test]
    fn off_center_blob_refines_toward_true_center() {
        // Blob center offset from the voxel center by a sub-voxel amount.
        let im = blob_scene(48, 24.8, 24.2, 24.6);
        let kps = refined_for(&im, RefineMethod::Parabolic);
        let best = kps
            .iter()
            .map(|k| {
                let f = k.coord_factor();
                ((k.xd * f - 24.8).powi(2)
                    + (k.yd * f - 24.2).powi(2)
                    + (k.zd * f - 24.6).powi(2))
                .sqrt()
            })
            .fold(f64::INFINITY, f64::min);
        assert!(best < 0.75, "closest refined keypoint is {best} voxels away");
    }
}
