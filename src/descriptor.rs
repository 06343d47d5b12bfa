//! Descriptor extraction and nearest-neighbor matching.
//!
//! A descriptor is a 4x4x4 grid of spherical gradient histograms taken over
//! a rotation-aligned window around the keypoint. Each in-window gradient is
//! Gaussian-weighted, rotated into the keypoint frame, and spread over the
//! eight surrounding spatial cells by trilinear interpolation; within each
//! cell it lands in the icosahedral histogram through barycentric weights of
//! the face it pierces (or, in the spherical-bin variant, bilinearly over
//! the azimuth/polar grid). The finished vector is L2-normalized, truncated
//! per bin, and renormalized.

use log::debug;
use nalgebra::Vector3;

use crate::keypoint::Keypoint;
use crate::mesh::{Mesh, ICOS_NVERT};
use crate::pyramid::Pyramid;
use crate::volume::{for_each_sphere, Volume};
use crate::{Error, HistKind, Result};

/// Histograms per spatial dimension of the descriptor grid.
pub const NHIST_PER_DIM: usize = 4;
/// Total histograms per descriptor.
pub const DESC_NUM_TOTAL_HIST: usize = NHIST_PER_DIM * NHIST_PER_DIM * NHIST_PER_DIM;
/// Azimuthal bins of the spherical histogram variant.
pub const NBINS_AZ: usize = 8;
/// Polar bins of the spherical histogram variant.
pub const NBINS_PO: usize = 4;

/// Ratio of the descriptor window parameter to the keypoint scale, `5 sqrt(2)`.
pub(crate) const DESC_SIG_FCTR: f64 = 7.071067812;
/// Ratio of the window radius to the window parameter.
pub(crate) const DESC_RAD_FCTR: f64 = 2.0;

const AZ_MAX: f64 = 2.0 * std::f64::consts::PI;
const PO_MAX: f64 = std::f64::consts::PI;

impl HistKind {
    /// Bins per histogram.
    pub fn hist_numel(self) -> usize {
        match self {
            HistKind::Icosahedral => ICOS_NVERT,
            HistKind::Spherical => NBINS_AZ * NBINS_PO,
        }
    }

    /// Bins per descriptor.
    pub fn desc_numel(self) -> usize {
        DESC_NUM_TOTAL_HIST * self.hist_numel()
    }

    /// Per-bin truncation threshold applied between the two normalization
    /// passes.
    pub fn trunc_thresh(self) -> f64 {
        0.2 * 128.0 / self.desc_numel() as f64
    }
}

/// A single descriptor, located in base-octave image coordinates.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Descriptor {
    pub xd: f64,
    pub yd: f64,
    pub zd: f64,
    pub sd: f64,
    /// Flat bin storage, `DESC_NUM_TOTAL_HIST * hist_numel` values in
    /// spatial-cell-major order.
    pub bins: Vec<f32>,
}

/// Descriptors extracted from one volume, with the dimensions of the source
/// pyramid's first level for spatial match gating.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DescriptorStore {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub descriptors: Vec<Descriptor>,
}

/// Spherical-coordinate bin position of a gradient.
struct SphBins {
    az: f64,
    po: f64,
    mag: f64,
}

fn to_sph_bins(v: &Vector3<f64>) -> Option<SphBins> {
    let mag = v.norm();
    if mag < f64::from(f32::EPSILON) * 1e2 {
        return None;
    }
    let mut az = v.y.atan2(v.x);
    if az < 0.0 {
        az += AZ_MAX;
    }
    let po = (v.z / mag).acos();
    Some(SphBins {
        az: az * NBINS_AZ as f64 / AZ_MAX,
        po: po * NBINS_PO as f64 / PO_MAX,
        mag,
    })
}

#[inline]
fn sph_bin_index(az: usize, po: usize) -> usize {
    az + po * NBINS_AZ
}

/// Deposit one rotated gradient into the histogram grid: trilinear over the
/// eight neighboring spatial cells, barycentric (or bilinear) over the
/// orientation bins.
fn acc_interp(mesh: &Mesh, kind: HistKind, vbins: Vector3<f64>, grad: &Vector3<f64>, bins: &mut [f32]) {
    let numel = kind.hist_numel();
    let dv = vbins.map(|t| t - t.floor());

    enum OriBins {
        Icos { idx: [usize; 3], bary: Vector3<f64>, mag: f64 },
        Sph(SphBins),
    }

    let ori = match kind {
        HistKind::Icosahedral => {
            let Some((face, bary, _k)) = mesh.bary_lookup(grad) else {
                return;
            };
            OriBins::Icos {
                idx: mesh.face(face).idx,
                bary,
                mag: grad.norm(),
            }
        }
        HistKind::Spherical => {
            let Some(sb) = to_sph_bins(grad) else {
                return;
            };
            OriBins::Sph(sb)
        }
    };

    for dx in 0..2usize {
        for dy in 0..2usize {
            for dz in 0..2usize {
                let x = vbins.x as i64 + dx as i64;
                let y = vbins.y as i64 + dy as i64;
                let z = vbins.z as i64 + dz as i64;
                let range = 0..NHIST_PER_DIM as i64;
                if !range.contains(&x) || !range.contains(&y) || !range.contains(&z) {
                    continue;
                }

                let weight = (if dx == 0 { 1.0 - dv.x } else { dv.x })
                    * (if dy == 0 { 1.0 - dv.y } else { dv.y })
                    * (if dz == 0 { 1.0 - dv.z } else { dv.z });

                let cell = x as usize + y as usize * NHIST_PER_DIM
                    + z as usize * NHIST_PER_DIM * NHIST_PER_DIM;
                let hist = &mut bins[cell * numel..(cell + 1) * numel];

                match &ori {
                    OriBins::Icos { idx, bary, mag } => {
                        hist[idx[0]] += (mag * weight * bary.x) as f32;
                        hist[idx[1]] += (mag * weight * bary.y) as f32;
                        hist[idx[2]] += (mag * weight * bary.z) as f32;
                    }
                    OriBins::Sph(sb) => {
                        let daz = sb.az - sb.az.floor();
                        let dpo = sb.po - sb.po.floor();
                        for dp in 0..2usize {
                            for da in 0..2usize {
                                let mut a = (sb.az as usize + da) % NBINS_AZ;
                                let mut p = sb.po as usize + dp;
                                if p >= NBINS_PO {
                                    // Polar overflow wraps through the pole:
                                    // shift azimuth by half a turn.
                                    a = (a + NBINS_AZ / 2) % NBINS_AZ;
                                    p = NBINS_PO - 1;
                                }
                                let w_ang = (if da == 0 { 1.0 - daz } else { daz })
                                    * (if dp == 0 { 1.0 - dpo } else { dpo });
                                hist[sph_bin_index(a, p)] += (sb.mag * weight * w_ang) as f32;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Optional per-histogram refinement. Solid-angle reweighting applies only
/// to the spherical variant, whose bins subtend unequal areas.
pub(crate) fn refine_hist(hist: &mut [f32], kind: HistKind, solid_angle_weight: bool) {
    if kind != HistKind::Spherical || !solid_angle_weight {
        return;
    }
    for p in 0..NBINS_PO {
        let po = p as f64 * PO_MAX / NBINS_PO as f64;
        let area = po.cos() - (po + PO_MAX / NBINS_PO as f64).cos();
        for a in 0..NBINS_AZ {
            hist[sph_bin_index(a, p)] /= area as f32;
        }
    }
}

/// L2-normalize a whole bin slice in one pass.
pub(crate) fn normalize_bins(bins: &mut [f32]) {
    let norm: f64 = bins.iter().map(|&b| b as f64 * b as f64).sum::<f64>().sqrt() + f64::EPSILON;
    let inv = (1.0 / norm) as f32;
    bins.iter_mut().for_each(|b| *b *= inv);
}

/// Extract one descriptor from the pyramid level the keypoint was found in.
fn extract_descrip(
    im: &Volume,
    mesh: &Mesh,
    key: &Keypoint,
    kind: HistKind,
    solid_angle_weight: bool,
) -> Descriptor {
    let sigma = key.sd_rel * DESC_SIG_FCTR;
    let win_radius = DESC_RAD_FCTR * sigma;
    let desc_width = win_radius / 2f64.sqrt();
    let desc_hw = desc_width / 2.0;
    let desc_bin_fctr = NHIST_PER_DIM as f64 / desc_width;
    let coord_factor = key.coord_factor();

    let numel = kind.hist_numel();
    let mut bins = vec![0.0f32; DESC_NUM_TOTAL_HIST * numel];

    let center = Vector3::new(key.xd, key.yd, key.zd);
    for_each_sphere(im, center, win_radius, |x, y, z, disp, sq_dist| {
        // Rotate the displacement into the keypoint frame and find which
        // spatial cells it feeds.
        let vkp = key.r * disp;
        let vbins = (vkp.add_scalar(desc_hw)) * desc_bin_fctr;
        if vbins.iter().any(|t| *t < 0.0 || *t >= NHIST_PER_DIM as f64) {
            return;
        }

        let weight = (-0.5 * sq_dist / (sigma * sigma)).exp();
        let grad = im.gradient(x, y, z) * weight;
        let grad_rot = key.r * grad;

        acc_interp(mesh, kind, vbins, &grad_rot, &mut bins);
    });

    for hist in bins.chunks_mut(numel) {
        refine_hist(hist, kind, solid_angle_weight);
    }

    normalize_bins(&mut bins);
    let trunc = kind.trunc_thresh() as f32;
    bins.iter_mut().for_each(|b| *b = b.min(trunc));
    normalize_bins(&mut bins);

    Descriptor {
        xd: key.xd * coord_factor,
        yd: key.yd * coord_factor,
        zd: key.zd * coord_factor,
        sd: key.sd,
        bins,
    }
}

/// Extract a descriptor for every keypoint, each from its own pyramid level.
pub(crate) fn extract_descriptors(
    gpyr: &Pyramid,
    mesh: &Mesh,
    keypoints: &[Keypoint],
    kind: HistKind,
    solid_angle_weight: bool,
) -> DescriptorStore {
    let first = gpyr.level(gpyr.first_octave(), gpyr.first_level());
    let (nx, ny, nz) = first.dims();
    let descriptors = keypoints
        .iter()
        .map(|key| {
            extract_descrip(gpyr.level(key.o, key.s), mesh, key, kind, solid_angle_weight)
        })
        .collect::<Vec<_>>();
    debug!("extracted {} descriptors", descriptors.len());
    DescriptorStore {
        nx,
        ny,
        nz,
        descriptors,
    }
}

/// Brute-force L2 nearest-neighbor matching from `a` to `b` with Lowe's
/// ratio test on squared distances.
///
/// Returns one entry per descriptor of `a`: the index of its match in `b`,
/// or -1. `match_max_dist`, when set, additionally rejects matches farther
/// apart than that fraction of the volume diagonal.
pub fn nn_match(
    a: &DescriptorStore,
    b: &DescriptorStore,
    nn_thresh: f64,
    match_max_dist: Option<f64>,
) -> Result<Vec<i32>> {
    if nn_thresh <= 0.0 {
        return Err(Error::InvalidParameter {
            name: "nn_thresh",
            value: nn_thresh,
            constraint: "must be greater than 0",
        });
    }
    if let (Some(da), Some(db)) = (a.descriptors.first(), b.descriptors.first()) {
        if da.bins.len() != db.bins.len() {
            return Err(Error::MismatchedDescriptors {
                left: da.bins.len(),
                right: db.bins.len(),
            });
        }
    }

    let dist_thresh = match_max_dist.map(|frac| {
        let diag = ((a.nx * a.nx + a.ny * a.ny + a.nz * a.nz) as f64).sqrt();
        diag * frac
    });

    let mut matches = vec![-1i32; a.descriptors.len()];
    for (i, da) in a.descriptors.iter().enumerate() {
        let mut ssd_best = f64::INFINITY;
        let mut ssd_second = f64::INFINITY;
        let mut best = None;
        for (j, db) in b.descriptors.iter().enumerate() {
            let ssd: f64 = da
                .bins
                .iter()
                .zip(&db.bins)
                .map(|(&u, &v)| {
                    let d = (u - v) as f64;
                    d * d
                })
                .sum();
            if ssd < ssd_best {
                ssd_second = ssd_best;
                ssd_best = ssd;
                best = Some(j);
            } else {
                ssd_second = ssd_second.min(ssd);
            }
        }

        let Some(j) = best else { continue };
        if !(ssd_best / ssd_second < nn_thresh * nn_thresh) {
            continue;
        }
        if let Some(thresh) = dist_thresh {
            let db = &b.descriptors[j];
            let dist = ((da.xd - db.xd).powi(2) + (da.yd - db.yd).powi(2)
                + (da.zd - db.zd).powi(2))
            .sqrt();
            if dist > thresh {
                continue;
            }
        }
        matches[i] = j as i32;
    }

    debug!(
        "matched {} of {} descriptors",
        matches.iter().filter(|&&m| m >= 0).count(),
        matches.len()
    );
    Ok(matches)
}

/// Like [`nn_match`], but keeps only forward-backward consistent matches:
/// `a[i] -> b[j]` survives only if `b[j]` matches back to `a[i]`.
pub fn nn_match_fb(
    a: &DescriptorStore,
    b: &DescriptorStore,
    nn_thresh: f64,
    match_max_dist: Option<f64>,
) -> Result<Vec<i32>> {
    let mut forward = nn_match(a, b, nn_thresh, match_max_dist)?;
    let backward = nn_match(b, a, nn_thresh, match_max_dist)?;
    for (i, m) in forward.iter_mut().enumerate() {
        if *m >= 0 && backward[*m as usize] != i as i32 {
            *m = -1;
        }
    }
    Ok(forward)
}

/// Convert a match list to two row-aligned coordinate matrices containing
/// only the valid matches.
pub fn match_coords(
    a: &DescriptorStore,
    b: &DescriptorStore,
    matches: &[i32],
) -> (Vec<[f64; 3]>, Vec<[f64; 3]>) {
    let mut left = Vec::new();
    let mut right = Vec::new();
    for (i, &m) in matches.iter().enumerate() {
        if m < 0 {
            continue;
        }
        let da = &a.descriptors[i];
        let db = &b.descriptors[m as usize];
        left.push([da.xd, da.yd, da.zd]);
        right.push([db.xd, db.yd, db.zd]);
    }
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn test_keypoint() -> Keypoint {
        Keypoint {
            o: 0,
            s: 0,
            xi: 20,
            yi: 20,
            zi: 20,
            xd: 20.5,
            yd: 20.5,
            zd: 20.5,
            sd: 1.6,
            sd_rel: 1.6,
            r: Matrix3::identity(),
        }
    }

    fn textured_volume(n: usize) -> Volume {
        Volume::from_fn(n, n, n, |x, y, z| {
            let (x, y, z) = (x as f64, y as f64, z as f64);
            ((0.31 * x).sin() + (0.27 * y + 0.1).cos() + (0.23 * z + 0.4).sin()) as f32
        })
    }

    #[test]
    fn descriptor_has_unit_norm() {
        let vol = textured_volume(42);
        let mesh = Mesh::regular_icosahedron();
        for kind in [HistKind::Icosahedral, HistKind::Spherical] {
            let d = extract_descrip(&vol, &mesh, &test_keypoint(), kind, false);
            assert_eq!(d.bins.len(), kind.desc_numel());
            let norm: f64 = d.bins.iter().map(|&b| (b as f64).powi(2)).sum::<f64>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "norm = {norm}");
        }
    }

    #[test]
    fn bins_respect_the_truncation_threshold() {
        let vol = textured_volume(42);
        let mesh = Mesh::regular_icosahedron();
        let kind = HistKind::Icosahedral;
        let d = extract_descrip(&vol, &mesh, &test_keypoint(), kind, false);
        // After the final renormalization bins may exceed the raw threshold
        // only by the renormalization factor, which is >= 1; check the
        // pre-normalization cap indirectly: no bin is wildly dominant.
        let max = d.bins.iter().cloned().fold(0.0f32, f32::max);
        assert!(max <= 1.0);
        assert!(max > 0.0);
    }

    #[test]
    fn descriptor_coordinates_are_scaled_to_base_octave() {
        let vol = textured_volume(42);
        let mesh = Mesh::regular_icosahedron();
        let mut key = test_keypoint();
        key.o = 1;
        key.sd_rel = key.sd * 0.5;
        let d = extract_descrip(&vol, &mesh, &key, HistKind::Icosahedral, false);
        assert_relative_eq!(d.xd, 41.0, epsilon = 1e-12);
        assert_relative_eq!(d.sd, key.sd, epsilon = 1e-12);
    }

    #[test]
    fn identical_stores_self_match() {
        let vol = textured_volume(42);
        let mesh = Mesh::regular_icosahedron();
        let mut kps = Vec::new();
        for (x, y, z) in [(14, 14, 14), (20, 24, 18), (26, 16, 24)] {
            let mut k = test_keypoint();
            (k.xi, k.yi, k.zi) = (x, y, z);
            (k.xd, k.yd, k.zd) = (x as f64 + 0.5, y as f64 + 0.5, z as f64 + 0.5);
            kps.push(k);
        }
        let store = DescriptorStore {
            nx: 42,
            ny: 42,
            nz: 42,
            descriptors: kps
                .iter()
                .map(|k| extract_descrip(&vol, &mesh, k, HistKind::Icosahedral, false))
                .collect(),
        };
        let matches = nn_match_fb(&store, &store, 0.8, None).unwrap();
        assert_eq!(matches, vec![0, 1, 2]);
    }

    #[test]
    fn ratio_test_rejects_ambiguous_matches() {
        let d = |v: f32| Descriptor {
            xd: 0.0,
            yd: 0.0,
            zd: 0.0,
            sd: 1.0,
            bins: vec![v; 12],
        };
        let a = DescriptorStore {
            nx: 10,
            ny: 10,
            nz: 10,
            descriptors: vec![d(0.5)],
        };
        // Two equidistant candidates: the ratio is 1, above any threshold.
        let b = DescriptorStore {
            nx: 10,
            ny: 10,
            nz: 10,
            descriptors: vec![d(0.4), d(0.6)],
        };
        let matches = nn_match(&a, &b, 0.8, None).unwrap();
        assert_eq!(matches, vec![-1]);
    }

    #[test]
    fn invalid_nn_thresh_is_rejected() {
        let store = DescriptorStore::default();
        assert!(nn_match(&store, &store, 0.0, None).is_err());
        assert!(nn_match(&store, &store, -1.0, None).is_err());
    }

    #[test]
    fn solid_angle_weighting_touches_only_spherical_histograms() {
        let mut icos = vec![1.0f32; 12];
        refine_hist(&mut icos, HistKind::Icosahedral, true);
        assert!(icos.iter().all(|&b| b == 1.0));

        let mut sph = vec![1.0f32; 32];
        refine_hist(&mut sph, HistKind::Spherical, true);
        // Polar rows get different weights; equatorial bins gain less than
        // the pole-adjacent rows lose.
        assert!(sph[0] != sph[sph_bin_index(0, 1)]);
    }
}
