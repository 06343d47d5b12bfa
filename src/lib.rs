// This implementation of 3D SIFT is derived from the volumetric SIFT3D
// detector by Blaine Rister et al.
// It is made available under the terms of the MIT license included in the
// root of this repository.

//! Scale-invariant 3D keypoint detection, orientation assignment, gradient
//! histogram descriptors, and descriptor matching for volumetric scalar
//! data.
//!
//! The pipeline generalizes classical SIFT from 2D images to 3D volumes:
//! a Gaussian/difference-of-Gaussian scale-space pyramid, scale-space
//! extremum detection with sub-voxel refinement, an eigenvector-based
//! orientation frame per keypoint, and a rotation-invariant descriptor made
//! of icosahedral gradient histograms.
//!
//! Useful resources:
//! - [Lowe 2004](https://www.cs.ubc.ca/~lowe/papers/ijcv04.pdf) for the 2D
//!   method this generalizes
//! - [Rister 2017](https://doi.org/10.1109/TIP.2017.2722689) for the 3D
//!   formulation implemented here
//!
//! ```
//! use sift3d_features::{Sift3d, Volume};
//!
//! let volume = Volume::from_fn(32, 32, 32, |x, y, z| {
//!     let d = (x as f32 - 16.0).hypot(y as f32 - 16.0).hypot(z as f32 - 16.0);
//!     (-d * d / 18.0).exp()
//! });
//! let mut sift = Sift3d::new();
//! let mut keypoints = Vec::new();
//! sift.detect_keypoints(&volume, &mut keypoints).unwrap();
//! let descriptors = sift.extract_descriptors(&keypoints).unwrap();
//! ```

use std::path::PathBuf;

use log::info;

mod dense;
mod descriptor;
mod io;
mod keypoint;
mod local_extrema;
mod mesh;
mod orientation;
mod pyramid;
mod refine;
mod volume;

pub use descriptor::{
    match_coords, nn_match, nn_match_fb, Descriptor, DescriptorStore, DESC_NUM_TOTAL_HIST,
    NBINS_AZ, NBINS_PO, NHIST_PER_DIM,
};
pub use io::{
    read_descriptors, read_keypoints, write_descriptors, write_keypoints, write_match_coords,
};
pub use keypoint::Keypoint;
pub use mesh::{Face, Mesh, ICOS_NFACES, ICOS_NVERT};
pub use pyramid::{GssFilters, Pyramid, PyramidParams, FIRST_LEVEL};
pub use volume::{apply_sep_fir, downsample_2x, subtract, GaussianKernel, Volume};

/// Default starting octave.
pub const FIRST_OCTAVE_DEFAULT: i32 = 0;
/// Default DoG peak threshold.
pub const PEAK_THRESH_DEFAULT: f64 = 0.03;
/// Default number of levels per octave in which keypoints are found.
pub const NUM_KP_LEVELS_DEFAULT: usize = 3;
/// Default minimum corner score.
pub const CORNER_THRESH_DEFAULT: f64 = 0.5;
/// Default nominal scale of the input data.
pub const SIGMA_N_DEFAULT: f64 = 1.15;
/// Default scale of the base of the pyramid.
pub const SIGMA0_DEFAULT: f64 = 1.6;

/// Gradient histogram binning scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HistKind {
    /// 12 bins on the vertices of a regular icosahedron, filled through
    /// barycentric face interpolation.
    #[default]
    Icosahedral,
    /// An 8x4 azimuth/polar grid, filled bilinearly.
    Spherical,
}

/// Neighborhood compared during extremum detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExtremaMode {
    /// 6 face neighbors per level, plus the center of the adjacent levels.
    #[default]
    FaceConnected,
    /// The full 26-neighborhood in every level.
    Cuboid,
}

/// Sub-voxel refinement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RefineMethod {
    /// Independent per-axis parabolic interpolation (historical default).
    #[default]
    Parabolic,
    /// Newton step on the full 4D scale-space Hessian.
    Newton,
}

/// Errors surfaced by the pipeline. Per-keypoint rejections are not errors;
/// they silently remove the keypoint.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter {name}: {value} ({constraint})")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        constraint: &'static str,
    },
    #[error("only single-channel volumes are supported, got {nc} channels")]
    InvalidChannels { nc: usize },
    #[error("extremum detection requires at least 3 DoG levels per octave, got {num_levels}")]
    TooFewDogLevels { num_levels: usize },
    #[error("volume of dimensions {nx}x{ny}x{nz} is too small for {num_octaves} octave(s)")]
    VolumeTooSmall {
        nx: usize,
        ny: usize,
        nz: usize,
        num_octaves: usize,
    },
    #[error("no image has been processed yet")]
    NoImage,
    #[error("descriptor lengths differ between stores: {left} vs {right}")]
    MismatchedDescriptors { left: usize, right: usize },
    #[error("unrecognized option {0:?}")]
    UnknownOption(String),
    #[error("option {0:?} expects a numeric argument")]
    MissingArgument(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{path}:{line}: {what}")]
    Malformed {
        path: PathBuf,
        line: usize,
        what: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Help text for the command-line options understood by
/// [`Sift3d::parse_args`].
pub const OPTS_HELP: &str = "\
SIFT3D options:
 --first_octave [value]
    The first octave of the pyramid. Must be an integer. (default: 0)
 --peak_thresh [value]
    The smallest allowed absolute DoG value, on the interval (0, inf).
    (default: 0.03)
 --corner_thresh [value]
    The smallest allowed corner score, on the interval [0, 1].
    (default: 0.50)
 --num_octaves [value]
    The number of octaves to process. Must be a positive integer.
    (default: process as many as we can)
 --num_kp_levels [value]
    The number of pyramid levels per octave in which keypoints are found.
    Must be a positive integer. (default: 3)
 --sigma_n [value]
    The nominal scale parameter of the input data, on the interval
    (0, inf). (default: 1.15)
 --sigma0 [value]
    The scale parameter of the first level of octave 0, on the interval
    (0, inf). (default: 1.60)
";

/// The 3D SIFT orchestrator.
///
/// Owns the pyramid parameters, the Gaussian filter bank, the icosahedral
/// mesh and the scale-space pyramids of the most recent image. Keypoint and
/// descriptor stores are caller-owned; this struct only fills them.
///
/// Cloning produces a deep copy: parameters and pyramid contents are
/// reproduced in the copy's own storage.
#[derive(Debug, Clone)]
pub struct Sift3d {
    first_octave: i32,
    num_octaves: i32,
    num_kp_levels: usize,
    sigma_n: f64,
    sigma0: f64,
    peak_thresh: f64,
    corner_thresh: f64,

    /// Histogram binning scheme used by descriptors.
    pub hist_kind: HistKind,
    /// Extremum comparison neighborhood.
    pub extrema_mode: ExtremaMode,
    /// Sub-voxel refinement strategy.
    pub refine_method: RefineMethod,
    /// Optional matching gate: maximum match distance as a fraction of the
    /// volume diagonal.
    pub match_max_dist: Option<f64>,
    /// Weight spherical histogram bins by their solid angle.
    pub ori_solid_angle_weight: bool,
    /// Use the rotation-invariant dense descriptor variant.
    pub dense_rotate: bool,

    mesh: Mesh,
    im_dims: Option<(usize, usize, usize)>,
    params: Option<PyramidParams>,
    gss: Option<GssFilters>,
    gpyr: Option<Pyramid>,
    dog: Option<Pyramid>,
}

impl Default for Sift3d {
    fn default() -> Self {
        Self::new()
    }
}

impl Sift3d {
    /// New orchestrator with the default parameters.
    pub fn new() -> Self {
        Self {
            first_octave: FIRST_OCTAVE_DEFAULT,
            num_octaves: -1,
            num_kp_levels: NUM_KP_LEVELS_DEFAULT,
            sigma_n: SIGMA_N_DEFAULT,
            sigma0: SIGMA0_DEFAULT,
            peak_thresh: PEAK_THRESH_DEFAULT,
            corner_thresh: CORNER_THRESH_DEFAULT,
            hist_kind: HistKind::default(),
            extrema_mode: ExtremaMode::default(),
            refine_method: RefineMethod::default(),
            match_max_dist: None,
            ori_solid_angle_weight: false,
            dense_rotate: false,
            mesh: Mesh::regular_icosahedron(),
            im_dims: None,
            params: None,
            gss: None,
            gpyr: None,
            dog: None,
        }
    }

    /// Set the first octave. Resizes the internal pyramid state.
    pub fn set_first_octave(&mut self, first_octave: i32) -> Result<()> {
        self.first_octave = first_octave;
        self.resize()
    }

    /// Set the peak threshold, checking that it is in `(0, inf)`.
    pub fn set_peak_thresh(&mut self, peak_thresh: f64) -> Result<()> {
        if !(peak_thresh > 0.0) {
            return Err(Error::InvalidParameter {
                name: "peak_thresh",
                value: peak_thresh,
                constraint: "must be greater than 0",
            });
        }
        self.peak_thresh = peak_thresh;
        Ok(())
    }

    /// Set the corner threshold, checking that it is in `[0, 1]`.
    pub fn set_corner_thresh(&mut self, corner_thresh: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&corner_thresh) {
            return Err(Error::InvalidParameter {
                name: "corner_thresh",
                value: corner_thresh,
                constraint: "must be in the interval [0, 1]",
            });
        }
        self.corner_thresh = corner_thresh;
        Ok(())
    }

    /// Set the number of octaves, or -1 to process as many as the input
    /// allows. Resizes the internal pyramid state.
    pub fn set_num_octaves(&mut self, num_octaves: i32) -> Result<()> {
        if num_octaves != -1 && num_octaves < 1 {
            return Err(Error::InvalidParameter {
                name: "num_octaves",
                value: num_octaves as f64,
                constraint: "must be positive or -1",
            });
        }
        self.num_octaves = num_octaves;
        self.resize()
    }

    /// Set the number of keypoint levels per octave. Resizes the internal
    /// pyramid state.
    pub fn set_num_kp_levels(&mut self, num_kp_levels: usize) -> Result<()> {
        if num_kp_levels < 1 {
            return Err(Error::InvalidParameter {
                name: "num_kp_levels",
                value: num_kp_levels as f64,
                constraint: "must be positive",
            });
        }
        self.num_kp_levels = num_kp_levels;
        self.resize()
    }

    /// Set the nominal scale of the input data, checking nonnegativity.
    pub fn set_sigma_n(&mut self, sigma_n: f64) -> Result<()> {
        if !(sigma_n >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "sigma_n",
                value: sigma_n,
                constraint: "must be nonnegative",
            });
        }
        self.sigma_n = sigma_n;
        self.resize()
    }

    /// Set the scale of the first level of octave 0, checking nonnegativity.
    pub fn set_sigma0(&mut self, sigma0: f64) -> Result<()> {
        if !(sigma0 >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "sigma0",
                value: sigma0,
                constraint: "must be nonnegative",
            });
        }
        self.sigma0 = sigma0;
        self.resize()
    }

    pub fn first_octave(&self) -> i32 {
        self.first_octave
    }

    /// Number of octaves that will be processed. Before an image is seen
    /// this may be -1, meaning "as many as the input allows".
    pub fn num_octaves(&self) -> i32 {
        self.params
            .map(|p| p.num_octaves as i32)
            .unwrap_or(self.num_octaves)
    }

    /// Index of the last octave, available once image dimensions are known.
    pub fn last_octave(&self) -> Option<i32> {
        self.params.map(|p| p.last_octave())
    }

    pub fn num_kp_levels(&self) -> usize {
        self.num_kp_levels
    }

    pub fn sigma_n(&self) -> f64 {
        self.sigma_n
    }

    pub fn sigma0(&self) -> f64 {
        self.sigma0
    }

    pub fn peak_thresh(&self) -> f64 {
        self.peak_thresh
    }

    pub fn corner_thresh(&self) -> f64 {
        self.corner_thresh
    }

    /// Declare the dimensions of the image to be processed, resolving the
    /// octave count and recomputing the Gaussian filter bank. Called
    /// implicitly by the detection entry points.
    pub fn set_image_dims(&mut self, nx: usize, ny: usize, nz: usize) -> Result<()> {
        // A previous failed resize leaves no pyramid shape; retry then too.
        if self.im_dims != Some((nx, ny, nz)) || self.params.is_none() {
            self.im_dims = Some((nx, ny, nz));
            self.gpyr = None;
            self.dog = None;
            self.resize()?;
        }
        Ok(())
    }

    /// Recompute the pyramid shape and filter bank for the current image
    /// dimensions. A no-op until an image has been seen.
    fn resize(&mut self) -> Result<()> {
        let Some((nx, ny, nz)) = self.im_dims else {
            self.params = None;
            self.gss = None;
            return Ok(());
        };

        let num_octaves = if self.num_octaves == -1 {
            // The smallest dimension bottoms out at 8 voxels.
            let min_dim = nx.min(ny).min(nz);
            let last_octave = (min_dim as f64).log2() as i32 - 3 - self.first_octave;
            last_octave - self.first_octave + 1
        } else {
            self.num_octaves
        };
        if num_octaves < 1 {
            return Err(Error::VolumeTooSmall {
                nx,
                ny,
                nz,
                num_octaves: num_octaves.max(0) as usize,
            });
        }
        // Dimensions halve once per octave above the first; the deepest
        // octave must keep an interior.
        let depth = num_octaves as u32 - 1;
        let min_dim = nx.min(ny).min(nz).checked_shr(depth).unwrap_or(0);
        if min_dim < 4 {
            return Err(Error::VolumeTooSmall {
                nx,
                ny,
                nz,
                num_octaves: num_octaves as usize,
            });
        }

        let params = PyramidParams {
            first_octave: self.first_octave,
            num_octaves: num_octaves as usize,
            num_kp_levels: self.num_kp_levels,
            sigma0: self.sigma0,
            sigma_n: self.sigma_n,
        };
        if params.sigma(self.first_octave, FIRST_LEVEL) < self.sigma_n {
            return Err(Error::InvalidParameter {
                name: "sigma0",
                value: self.sigma0,
                constraint: "base pyramid level would be sharper than sigma_n",
            });
        }

        self.gss = Some(GssFilters::new(&params));
        self.params = Some(params);
        Ok(())
    }

    fn build_pyramids(&mut self, im: &Volume) -> Result<()> {
        if im.nc() != 1 {
            return Err(Error::InvalidChannels { nc: im.nc() });
        }
        self.set_image_dims(im.nx(), im.ny(), im.nz())?;
        let params = self.params.as_ref().expect("resize populated params");
        let gss = self.gss.as_ref().expect("resize populated filters");

        let gpyr = Pyramid::build_gaussian(im, params, gss);
        let dog = Pyramid::build_dog(&gpyr);
        self.gpyr = Some(gpyr);
        self.dog = Some(dog);
        Ok(())
    }

    /// Detect scale-space extremum candidates and refine them to sub-voxel
    /// accuracy, without assigning orientations. The keypoint store is
    /// cleared and refilled.
    pub fn detect_candidates(&mut self, im: &Volume, keypoints: &mut Vec<Keypoint>) -> Result<()> {
        self.build_pyramids(im)?;
        let dog = self.dog.as_ref().expect("pyramids built above");

        *keypoints = local_extrema::detect_extrema(dog, self.peak_thresh, self.extrema_mode)?;
        refine::refine_keypoints(dog, keypoints, self.refine_method);
        Ok(())
    }

    /// Run the full detection pipeline: pyramids, extrema, refinement and
    /// orientation assignment. Unstable keypoints are silently dropped; the
    /// survivors appear in raster-scan order.
    pub fn detect_keypoints(&mut self, im: &Volume, keypoints: &mut Vec<Keypoint>) -> Result<()> {
        self.detect_candidates(im, keypoints)?;
        let gpyr = self.gpyr.as_ref().expect("pyramids built above");
        orientation::assign_orientations(gpyr, keypoints, self.corner_thresh);
        info!(
            "detected {} keypoints in {:?} volume",
            keypoints.len(),
            im.dims()
        );
        Ok(())
    }

    /// Extract a descriptor for each keypoint from the pyramid built by the
    /// last detection call.
    pub fn extract_descriptors(&self, keypoints: &[Keypoint]) -> Result<DescriptorStore> {
        let gpyr = self.gpyr.as_ref().ok_or(Error::NoImage)?;
        Ok(descriptor::extract_descriptors(
            gpyr,
            &self.mesh,
            keypoints,
            self.hist_kind,
            self.ori_solid_angle_weight,
        ))
    }

    /// Extract one descriptor per voxel, returned as a volume with
    /// [`ICOS_NVERT`] channels.
    pub fn extract_dense_descriptors(&self, im: &Volume) -> Result<Volume> {
        dense::extract_dense_descriptors(
            im,
            &self.mesh,
            &dense::DenseParams {
                sigma_n: self.sigma_n,
                sigma0: self.sigma0,
                corner_thresh: self.corner_thresh,
                rotate: self.dense_rotate,
                solid_angle_weight: self.ori_solid_angle_weight,
            },
        )
    }

    /// Match descriptors from `a` to `b` with Lowe's ratio test, honoring
    /// the configured distance gate. Unmatched entries are -1.
    pub fn match_descriptors(
        &self,
        a: &DescriptorStore,
        b: &DescriptorStore,
        nn_thresh: f64,
    ) -> Result<Vec<i32>> {
        nn_match(a, b, nn_thresh, self.match_max_dist)
    }

    /// Like [`Sift3d::match_descriptors`], keeping only forward-backward
    /// consistent matches.
    pub fn match_descriptors_fb(
        &self,
        a: &DescriptorStore,
        b: &DescriptorStore,
        nn_thresh: f64,
    ) -> Result<Vec<i32>> {
        nn_match_fb(a, b, nn_thresh, self.match_max_dist)
    }

    /// Apply long-form `--name value` options to this orchestrator.
    ///
    /// Recognized options are consumed; the remaining arguments are
    /// returned in order. In strict mode an unrecognized `--option` is an
    /// error; otherwise it is passed through.
    pub fn parse_args(&mut self, args: &[String], strict: bool) -> Result<Vec<String>> {
        fn numeric(args: &[String], i: usize) -> Result<f64> {
            args.get(i + 1)
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| Error::MissingArgument(args[i].clone()))
        }

        let mut rest = Vec::new();
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();
            match arg {
                "--first_octave" => {
                    self.set_first_octave(numeric(args, i)? as i32)?;
                    i += 2;
                }
                "--peak_thresh" => {
                    self.set_peak_thresh(numeric(args, i)?)?;
                    i += 2;
                }
                "--corner_thresh" => {
                    self.set_corner_thresh(numeric(args, i)?)?;
                    i += 2;
                }
                "--num_octaves" => {
                    let v = numeric(args, i)?;
                    if v <= 0.0 {
                        return Err(Error::InvalidParameter {
                            name: "num_octaves",
                            value: v,
                            constraint: "must be positive",
                        });
                    }
                    self.set_num_octaves(v as i32)?;
                    i += 2;
                }
                "--num_kp_levels" => {
                    let v = numeric(args, i)?;
                    if v <= 0.0 {
                        return Err(Error::InvalidParameter {
                            name: "num_kp_levels",
                            value: v,
                            constraint: "must be positive",
                        });
                    }
                    self.set_num_kp_levels(v as usize)?;
                    i += 2;
                }
                "--sigma_n" => {
                    self.set_sigma_n(numeric(args, i)?)?;
                    i += 2;
                }
                "--sigma0" => {
                    self.set_sigma0(numeric(args, i)?)?;
                    i += 2;
                }
                _ if strict && arg.starts_with("--") => {
                    return Err(Error::UnknownOption(arg.to_string()));
                }
                _ => {
                    rest.push(args[i].clone());
                    i += 1;
                }
            }
        }
        Ok(rest)
    }
}
