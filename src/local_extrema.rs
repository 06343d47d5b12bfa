//! Scale-space extremum detection on the DoG pyramid.

use log::debug;

use crate::keypoint::Keypoint;
use crate::pyramid::Pyramid;
use crate::volume::Volume;
use crate::{Error, ExtremaMode, Result};

/// Face-connected neighbor offsets within one level.
const FACE_OFFSETS: [(i64, i64, i64); 6] = [
    (1, 0, 0),
    (-1, 0, 0),
    (0, 1, 0),
    (0, -1, 0),
    (0, 0, 1),
    (0, 0, -1),
];

#[inline]
fn beats_neighbors(
    im: &Volume,
    x: usize,
    y: usize,
    z: usize,
    val: f32,
    maximum: bool,
    ignore_self: bool,
    mode: ExtremaMode,
) -> bool {
    let cmp = |other: f32| if maximum { val > other } else { val < other };
    match mode {
        ExtremaMode::FaceConnected => {
            for (dx, dy, dz) in FACE_OFFSETS {
                let other = im.at(
                    (x as i64 + dx) as usize,
                    (y as i64 + dy) as usize,
                    (z as i64 + dz) as usize,
                );
                if !cmp(other) {
                    return false;
                }
            }
            ignore_self || cmp(im.at(x, y, z))
        }
        ExtremaMode::Cuboid => {
            for dz in -1i64..=1 {
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if (dx, dy, dz) == (0, 0, 0) && ignore_self {
                            continue;
                        }
                        let other = im.at(
                            (x as i64 + dx) as usize,
                            (y as i64 + dy) as usize,
                            (z as i64 + dz) as usize,
                        );
                        if !cmp(other) {
                            return false;
                        }
                    }
                }
            }
            true
        }
    }
}

/// Scan every interior voxel of every DoG level (excluding the first and
/// last of each octave) for strict local extrema in scale space.
///
/// The peak threshold is rescaled per level by the level's maximum absolute
/// value. Candidates are emitted in raster order.
pub(crate) fn detect_extrema(
    dog: &Pyramid,
    peak_thresh: f64,
    mode: ExtremaMode,
) -> Result<Vec<Keypoint>> {
    if dog.num_levels() < 3 {
        return Err(Error::TooFewDogLevels {
            num_levels: dog.num_levels(),
        });
    }

    let mut keypoints = Vec::new();
    for o in dog.first_octave()..=dog.last_octave() {
        for s in dog.first_level() + 1..=dog.last_level() - 1 {
            let prev = dog.level(o, s - 1);
            let cur = dog.level(o, s);
            let next = dog.level(o, s + 1);

            let thresh = peak_thresh as f32 * cur.max_abs();

            let (nx, ny, nz) = cur.dims();
            if nx < 3 || ny < 3 || nz < 3 {
                continue;
            }
            for z in 1..=nz - 2 {
                for y in 1..=ny - 2 {
                    for x in 1..=nx - 2 {
                        let p = cur.at(x, y, z);
                        if p.abs() <= thresh {
                            continue;
                        }
                        let is_max = beats_neighbors(prev, x, y, z, p, true, false, mode)
                            && beats_neighbors(cur, x, y, z, p, true, true, mode)
                            && beats_neighbors(next, x, y, z, p, true, false, mode);
                        let is_min = !is_max
                            && beats_neighbors(prev, x, y, z, p, false, false, mode)
                            && beats_neighbors(cur, x, y, z, p, false, true, mode)
                            && beats_neighbors(next, x, y, z, p, false, false, mode);
                        if is_max || is_min {
                            keypoints.push(Keypoint::candidate(o, s, x, y, z));
                        }
                    }
                }
            }
        }
    }

    debug!("extremum scan found {} candidates", keypoints.len());
    Ok(keypoints)
}
