//! Dense per-voxel descriptors.
//!
//! Instead of detecting keypoints, every voxel of the input receives one
//! 12-bin icosahedral gradient histogram, returned as a 12-channel volume.
//! The fast variant assigns each voxel's own gradient to its face and blurs
//! the channel volume; the rotation-invariant variant runs the orientation
//! stage per voxel and integrates a single-cell descriptor window.

use log::debug;
use nalgebra::{Matrix3, Vector3};

use crate::descriptor::{normalize_bins, refine_hist, DESC_RAD_FCTR, DESC_SIG_FCTR, NHIST_PER_DIM};
use crate::mesh::{Mesh, ICOS_NVERT};
use crate::orientation::{assign_eig_ori, ORI_SIG_FCTR};
use crate::volume::{apply_sep_fir, for_each_sphere, GaussianKernel, Volume};
use crate::{Error, HistKind, Result};

/// Parameters of a dense extraction run.
pub(crate) struct DenseParams {
    pub sigma_n: f64,
    pub sigma0: f64,
    pub corner_thresh: f64,
    pub rotate: bool,
    pub solid_angle_weight: bool,
}

/// Extract a dense descriptor volume with [`ICOS_NVERT`] channels.
pub(crate) fn extract_dense_descriptors(
    im: &Volume,
    mesh: &Mesh,
    p: &DenseParams,
) -> Result<Volume> {
    if im.nc() != 1 {
        return Err(Error::InvalidChannels { nc: im.nc() });
    }

    // Bring the input to the base blur level of the pyramid.
    let smooth = apply_sep_fir(im, &GaussianKernel::incremental(p.sigma_n, p.sigma0));

    let mut desc = if p.rotate {
        dense_rotate(&smooth, mesh, p)
    } else {
        dense_no_rotate(&smooth, mesh, p)
    };

    // Per-voxel refinement: refine, normalize, truncate, renormalize, then
    // restore the source voxel's intensity as the histogram norm.
    let kind = HistKind::Icosahedral;
    let hist_trunc =
        (kind.trunc_thresh() * kind.desc_numel() as f64 / ICOS_NVERT as f64) as f32;
    let (nx, ny, nz) = desc.dims();
    let mut hist = [0.0f32; ICOS_NVERT];
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                for (c, h) in hist.iter_mut().enumerate() {
                    *h = desc.get(x, y, z, c);
                }
                refine_hist(&mut hist, kind, p.solid_angle_weight);
                normalize_bins(&mut hist);
                hist.iter_mut().for_each(|h| *h = h.min(hist_trunc));
                normalize_bins(&mut hist);
                let val = im.at(x, y, z);
                for (c, h) in hist.iter().enumerate() {
                    desc.set(x, y, z, c, h * val);
                }
            }
        }
    }

    debug!(
        "extracted dense descriptors for {:?} voxels (rotate: {})",
        im.dims(),
        p.rotate
    );
    Ok(desc)
}

/// Fast dense variant: write each interior voxel's barycentric weights into
/// three channels, then blur every channel with the descriptor window.
fn dense_no_rotate(smooth: &Volume, mesh: &Mesh, p: &DenseParams) -> Volume {
    let (nx, ny, nz) = smooth.dims();
    let mut splat = Volume::zeros(nx, ny, nz, ICOS_NVERT);

    for z in 1..nz - 1 {
        for y in 1..ny - 1 {
            for x in 1..nx - 1 {
                let grad = smooth.gradient(x, y, z);
                let Some((face, bary, _k)) = mesh.bary_lookup(&grad) else {
                    continue;
                };
                let idx = mesh.face(face).idx;
                splat.set(x, y, z, idx[0], bary.x as f32);
                splat.set(x, y, z, idx[1], bary.y as f32);
                splat.set(x, y, z, idx[2], bary.z as f32);
            }
        }
    }

    let sigma_win = p.sigma0 * DESC_SIG_FCTR / NHIST_PER_DIM as f64;
    apply_sep_fir(&splat, &GaussianKernel::new(sigma_win))
}

/// Rotation-invariant dense variant: orient every voxel (identity on
/// reject) and integrate one histogram over its window.
fn dense_rotate(smooth: &Volume, mesh: &Mesh, p: &DenseParams) -> Volume {
    let (nx, ny, nz) = smooth.dims();
    let mut desc = Volume::zeros(nx, ny, nz, ICOS_NVERT);

    let ori_sigma = p.sigma0 * ORI_SIG_FCTR;
    let desc_sigma = p.sigma0 * DESC_SIG_FCTR / NHIST_PER_DIM as f64;

    let mut hist = [0.0f32; ICOS_NVERT];
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let center =
                    Vector3::new(x as f64 + 0.5, y as f64 + 0.5, z as f64 + 0.5);
                let r = assign_eig_ori(smooth, center, ori_sigma, p.corner_thresh)
                    .unwrap_or_else(Matrix3::identity);
                dense_descrip_rotate(smooth, mesh, center, desc_sigma, &r, &mut hist);
                for (c, h) in hist.iter().enumerate() {
                    desc.set(x, y, z, c, *h);
                }
            }
        }
    }
    desc
}

/// One single-cell rotated histogram over the descriptor window.
fn dense_descrip_rotate(
    im: &Volume,
    mesh: &Mesh,
    center: Vector3<f64>,
    sigma: f64,
    r: &Matrix3<f64>,
    hist: &mut [f32; ICOS_NVERT],
) {
    let win_radius = DESC_RAD_FCTR * sigma;
    hist.fill(0.0);

    for_each_sphere(im, center, win_radius, |x, y, z, _disp, sq_dist| {
        let grad = im.gradient(x, y, z);
        let grad_rot = r * grad;
        let Some((face, bary, _k)) = mesh.bary_lookup(&grad_rot) else {
            return;
        };
        let idx = mesh.face(face).idx;
        let mag = grad.norm();
        let weight = (-0.5 * sq_dist / (sigma * sigma)).exp();
        hist[idx[0]] += (mag * weight * bary.x) as f32;
        hist[idx[1]] += (mag * weight * bary.y) as f32;
        hist[idx[2]] += (mag * weight * bary.z) as f32;
    });
}
