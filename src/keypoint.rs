//! Keypoint model shared by the detection stages.

use nalgebra::Matrix3;

/// A scale-space keypoint.
///
/// Created by extremum detection with integer coordinates, given sub-voxel
/// coordinates by refinement, and an orientation by the eigenvector stage;
/// afterwards it is immutable. `(xd, yd, zd, sd)` are expressed in the
/// coordinates of octave `o`; `sd_rel = sd * 2^-o` rescales the blur level
/// to that octave's grid.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Keypoint {
    /// Octave index in the pyramid.
    pub o: i32,
    /// Level index within the octave.
    pub s: i32,
    /// Integer voxel of detection, kept in sync with `floor(xd, yd, zd)`.
    pub xi: usize,
    pub yi: usize,
    pub zi: usize,
    /// Refined location in octave coordinates.
    pub xd: f64,
    pub yd: f64,
    pub zd: f64,
    /// Refined scale.
    pub sd: f64,
    /// Scale relative to the octave grid.
    pub sd_rel: f64,
    /// Right-handed local frame; rows are the frame axes, so `r * v` maps an
    /// image-space displacement into keypoint space.
    pub r: Matrix3<f64>,
}

impl Keypoint {
    /// Fresh candidate at an integer voxel, before refinement.
    pub(crate) fn candidate(o: i32, s: i32, xi: usize, yi: usize, zi: usize) -> Self {
        Self {
            o,
            s,
            xi,
            yi,
            zi,
            xd: xi as f64 + 0.5,
            yd: yi as f64 + 0.5,
            zd: zi as f64 + 0.5,
            sd: 0.0,
            sd_rel: 0.0,
            r: Matrix3::identity(),
        }
    }

    /// Factor taking octave coordinates back to the base octave.
    pub fn coord_factor(&self) -> f64 {
        2f64.powi(self.o)
    }
}
