//! Synthetic volumes shared by the pipeline tests.

use sift3d_features::Volume;

/// An isotropic Gaussian blob of width `sigma` and unit peak amplitude
/// centered at the continuous point `(cx, cy, cz)`.
pub fn gaussian_blob(n: usize, cx: f64, cy: f64, cz: f64, sigma: f64) -> Volume {
    Volume::from_fn(n, n, n, |x, y, z| {
        let dx = x as f64 + 0.5 - cx;
        let dy = y as f64 + 0.5 - cy;
        let dz = z as f64 + 0.5 - cz;
        (-(dx * dx + dy * dy + dz * dz) / (2.0 * sigma * sigma)).exp() as f32
    })
}

/// An asymmetric scene: one ellipsoidal main blob flanked by two smaller
/// spherical blobs, rotated about the z-axis through the volume center by
/// `angle` radians. The field is evaluated analytically, so the rotated
/// scene carries no resampling error.
pub fn blob_scene(n: usize, angle: f64) -> Volume {
    let c = n as f64 / 2.0;
    let (sin, cos) = angle.sin_cos();
    Volume::from_fn(n, n, n, |x, y, z| {
        // Rotate the sample point backwards into scene coordinates.
        let px = x as f64 + 0.5 - c;
        let py = y as f64 + 0.5 - c;
        let pz = z as f64 + 0.5 - c;
        let qx = cos * px + sin * py;
        let qy = -sin * px + cos * py;

        let dx = qx - 6.0;
        let mut v = (-0.5 * ((dx / 3.2).powi(2) + (qy / 2.2).powi(2) + (pz / 2.7).powi(2))).exp();
        for (ox, oy, oz, amp) in [(11.0, 2.0, 0.0, 0.55), (4.0, 5.0, 3.0, 0.35)] {
            let ddx = qx - ox;
            let ddy = qy - oy;
            let ddz = pz - oz;
            v += amp * (-0.5 * (ddx * ddx + ddy * ddy + ddz * ddz) / (1.5 * 1.5)).exp();
        }
        v as f32
    })
}

/// Center of the main blob of [`blob_scene`] after rotation by `angle`.
pub fn main_blob_center(n: usize, angle: f64) -> [f64; 3] {
    let c = n as f64 / 2.0;
    let (sin, cos) = angle.sin_cos();
    [c + 6.0 * cos, c + 6.0 * sin, c]
}

/// Rotate a point about the z-axis through the volume center.
pub fn rotate_z(n: usize, p: [f64; 3], angle: f64) -> [f64; 3] {
    let c = n as f64 / 2.0;
    let (sin, cos) = angle.sin_cos();
    let dx = p[0] - c;
    let dy = p[1] - c;
    [c + cos * dx - sin * dy, c + sin * dx + cos * dy, p[2]]
}
