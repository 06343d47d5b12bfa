//! Eigenvector-based orientation assignment.
//!
//! A Gaussian-weighted structure tensor is accumulated over a spherical
//! window around the keypoint; its two leading eigenvectors, sign-flipped to
//! agree with the windowed gradient sum and completed by their cross
//! product, form a right-handed local frame. Keypoints with weak gradients,
//! near-equal eigenvalues or a poor corner score are rejected.

use log::debug;
use nalgebra::{Matrix3, SymmetricEigen, Vector3};

use crate::keypoint::Keypoint;
use crate::pyramid::Pyramid;
use crate::volume::{for_each_sphere, Volume};

/// Ratio of the orientation window parameter to the keypoint scale.
pub(crate) const ORI_SIG_FCTR: f64 = 1.5;
/// Ratio of the window radius to the window parameter.
pub(crate) const ORI_RAD_FCTR: f64 = 3.0;
/// Maximum ratio of adjacent eigenvalue magnitudes.
const MAX_EIG_RATIO: f64 = 0.90;
/// Minimum squared norm of the windowed gradient sum.
const ORI_GRAD_THRESH: f64 = 1e-10;

/// Compute the local orientation frame at `center`, or `None` if the
/// neighborhood is too unstable to orient. The returned matrix has the
/// frame axes as rows, so `r * v` takes image space to keypoint space.
pub(crate) fn assign_eig_ori(
    im: &Volume,
    center: Vector3<f64>,
    sigma: f64,
    corner_thresh: f64,
) -> Option<Matrix3<f64>> {
    let win_radius = sigma * ORI_RAD_FCTR;

    let mut tensor = Matrix3::zeros();
    let mut g_win = Vector3::zeros();
    for_each_sphere(im, center, win_radius, |x, y, z, _disp, sq_dist| {
        let weight = (-0.5 * sq_dist / (sigma * sigma)).exp();
        let g = im.gradient(x, y, z);
        tensor += g * g.transpose() * weight;
        g_win += g;
    });

    if g_win.norm_squared() < ORI_GRAD_THRESH {
        return None;
    }

    let eig = SymmetricEigen::new(tensor);
    // Ascending eigenvalue order, as the dense solvers this stage was built
    // around return it.
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
    let lambda = [
        eig.eigenvalues[order[0]],
        eig.eigenvalues[order[1]],
        eig.eigenvalues[order[2]],
    ];
    if lambda.iter().any(|l| !l.is_finite()) {
        return None;
    }
    for i in 0..2 {
        if (lambda[i] / lambda[i + 1]).abs() > MAX_EIG_RATIO {
            return None;
        }
    }

    let mut r = Matrix3::zeros();
    let mut axes = [Vector3::zeros(); 2];
    for i in 0..2 {
        // Leading eigenvectors in descending eigenvalue order.
        let mut v: Vector3<f64> = eig.eigenvectors.column(order[2 - i]).into_owned();

        let d = g_win.dot(&v);
        let cos_ang = d / (v.norm() * g_win.norm());
        if cos_ang.abs() < corner_thresh {
            return None;
        }
        // Enforce a positive directional derivative along each axis.
        if d < 0.0 {
            v = -v;
        }
        r.set_row(i, &v.transpose());
        axes[i] = v;
    }
    r.set_row(2, &axes[0].cross(&axes[1]).transpose());

    Some(r)
}

/// Assign a rotation matrix to each keypoint, removing those that cannot be
/// oriented stably. Survivors keep their relative order.
pub(crate) fn assign_orientations(gpyr: &Pyramid, keypoints: &mut Vec<Keypoint>, corner_thresh: f64) {
    let before = keypoints.len();
    keypoints.retain_mut(|key| {
        let level = gpyr.level(key.o, key.s);
        let center = Vector3::new(key.xd, key.yd, key.zd);
        let sigma = ORI_SIG_FCTR * key.sd_rel;
        match assign_eig_ori(level, center, sigma, corner_thresh) {
            Some(r) => {
                key.r = r;
                true
            }
            None => false,
        }
    });
    debug!(
        "orientation assignment kept {} of {} keypoints",
        keypoints.len(),
        before
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Asymmetric three-blob scene; orientation at the main blob is stable.
    fn scene(n: usize) -> (Volume, Vector3<f64>) {
        let c = n as f64 / 2.0;
        let blobs: [(f64, f64, f64, f64, f64); 3] = [
            (0.0, 0.0, 0.0, 2.5, 1.0),
            (5.0, 2.0, 0.0, 1.5, 0.55),
            (-2.0, 5.0, 3.0, 1.5, 0.35),
        ];
        let vol = Volume::from_fn(n, n, n, |x, y, z| {
            let mut v = 0.0f64;
            for (ox, oy, oz, sb, amp) in blobs {
                let dx = x as f64 + 0.5 - (c + ox);
                let dy = y as f64 + 0.5 - (c + oy);
                let dz = z as f64 + 0.5 - (c + oz);
                v += amp * (-(dx * dx + dy * dy + dz * dz) / (2.0 * sb * sb)).exp();
            }
            v as f32
        });
        (vol, Vector3::new(c, c, c))
    }

    #[test]
    fn frame_is_a_right_handed_rotation() {
        let (vol, center) = scene(40);
        let r = assign_eig_ori(&vol, center, 3.0, 0.0).expect("orientable neighborhood");

        let rtr = r.transpose() * r;
        let err = (rtr - Matrix3::identity()).abs().max();
        assert!(err < 1e-5, "R^T R deviates from I by {err}");
        assert!(r.determinant() > 0.0);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn uniform_region_is_rejected_for_weak_gradient() {
        let vol = Volume::from_fn(24, 24, 24, |_, _, _| 0.5);
        assert!(assign_eig_ori(&vol, Vector3::new(12.0, 12.0, 12.0), 2.0, 0.0).is_none());
    }

    #[test]
    fn isotropic_neighborhood_fails_the_eigenvalue_ratio() {
        // A single spherical blob has a degenerate structure tensor at its
        // center: all eigenvalues nearly equal.
        let vol = Volume::from_fn(32, 32, 32, |x, y, z| {
            let dx = x as f64 + 0.5 - 16.0;
            let dy = y as f64 + 0.5 - 16.0;
            let dz = z as f64 + 0.5 - 16.0;
            (-(dx * dx + dy * dy + dz * dz) / 8.0).exp() as f32
        });
        assert!(assign_eig_ori(&vol, Vector3::new(16.0, 16.0, 16.0), 2.0, 0.0).is_none());
    }

    #[test]
    fn strict_corner_threshold_rejects_blob_centers() {
        let (vol, center) = scene(40);
        assert!(assign_eig_ori(&vol, center, 3.0, 0.0).is_some());
        assert!(assign_eig_ori(&vol, center, 3.0, 0.9).is_none());
    }

    #[test]
    fn axes_follow_the_windowed_gradient_sign() {
        let (vol, center) = scene(40);
        let r = assign_eig_ori(&vol, center, 3.0, 0.0).unwrap();

        // Recompute the windowed gradient sum and check positive projections.
        let mut g_win = Vector3::zeros();
        for_each_sphere(&vol, center, 3.0 * ORI_RAD_FCTR, |x, y, z, _, _| {
            g_win += vol.gradient(x, y, z);
        });
        assert!(g_win.dot(&r.row(0).transpose()) > 0.0);
        assert!(g_win.dot(&r.row(1).transpose()) > 0.0);
    }
}
