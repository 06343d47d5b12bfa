//! Regular-icosahedron geometry backing the 12-bin gradient histograms.
//!
//! The 12 vertices double as histogram bins; a 3D direction deposits weight
//! into the three vertices of the face its ray pierces, with barycentric
//! interpolation.

use nalgebra::Vector3;

/// Number of icosahedron vertices, and thus icosahedral histogram bins.
pub const ICOS_NVERT: usize = 12;
/// Number of icosahedron faces.
pub const ICOS_NFACES: usize = 20;

/// Golden ratio.
const GR: f64 = 1.6180339887;

/// Error tolerance for barycentric coordinates.
pub(crate) const BARY_EPS: f64 = f32::EPSILON as f64 * 1e1;

/// One triangular face: three unit vertices and their histogram bin indices.
#[derive(Debug, Clone)]
pub struct Face {
    pub v: [Vector3<f64>; 3],
    pub idx: [usize; 3],
}

/// The unit icosahedron, built once per orchestrator.
#[derive(Debug, Clone)]
pub struct Mesh {
    faces: Vec<Face>,
}

/// Vertices of a regular icosahedron, before scaling to unit length.
#[rustfmt::skip]
const VERTICES: [[f64; 3]; ICOS_NVERT] = [
    [0.0,  1.0,  GR], [0.0, -1.0,  GR], [0.0,  1.0, -GR], [0.0, -1.0, -GR],
    [1.0,  GR,  0.0], [-1.0, GR,  0.0], [1.0, -GR,  0.0], [-1.0, -GR, 0.0],
    [GR,  0.0,  1.0], [-GR, 0.0,  1.0], [GR,  0.0, -1.0], [-GR, 0.0, -1.0],
];

/// Vertex triplets forming the faces of the icosahedron.
#[rustfmt::skip]
const FACES: [[usize; 3]; ICOS_NFACES] = [
    [0, 1, 8], [0, 8, 4], [0, 4, 5], [0, 5, 9], [0, 9, 1],
    [1, 6, 8], [8, 6, 10], [8, 10, 4], [4, 10, 2], [4, 2, 5],
    [5, 2, 11], [5, 11, 9], [9, 11, 7], [9, 7, 1], [1, 7, 6],
    [3, 6, 7], [3, 7, 11], [3, 11, 2], [3, 2, 10], [3, 10, 6],
];

impl Mesh {
    /// Build the unit icosahedron and orient every face outward.
    pub fn regular_icosahedron() -> Self {
        let mag_expected = (1.0 + GR * GR).sqrt();
        let verts: Vec<Vector3<f64>> = VERTICES
            .iter()
            .map(|v| {
                let v = Vector3::new(v[0], v[1], v[2]);
                assert!((v.norm() - mag_expected).abs() < 1e-10);
                v / v.norm()
            })
            .collect();

        let faces = FACES
            .iter()
            .map(|&idx| {
                let mut v = [verts[idx[0]], verts[idx[1]], verts[idx[2]]];
                let mut idx = idx;

                // Normal at v0 is (v2 - v1) x (v1 - v0); flip the winding if
                // it faces the origin.
                let mut n = (v[2] - v[1]).cross(&(v[1] - v[0]));
                if n.dot(&v[0]) < 0.0 {
                    v.swap(0, 1);
                    idx.swap(0, 1);
                    n = (v[2] - v[1]).cross(&(v[1] - v[0]));
                }
                assert!(n.dot(&v[0]) >= 0.0);

                // All faces of the icosahedron are equilateral.
                let e01 = (v[1] - v[0]).norm();
                let e12 = (v[2] - v[1]).norm();
                let e02 = (v[2] - v[0]).norm();
                assert!((e12 - e01).abs() < 1e-10);
                assert!((e12 - e02).abs() < 1e-10);

                Face { v, idx }
            })
            .collect();

        Self { faces }
    }

    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    pub fn face(&self, i: usize) -> &Face {
        &self.faces[i]
    }

    /// Find the face pierced by the ray from the origin through `x`.
    ///
    /// Returns the face index, the barycentric coordinates `(a, b, c)` and
    /// the ray constant `k` with `k * x = a v0 + b v1 + c v2`. Faces are
    /// scanned in declared order; the first accepting face wins. Fails only
    /// for vanishingly small `x`.
    pub fn bary_lookup(&self, x: &Vector3<f64>) -> Option<(usize, Vector3<f64>, f64)> {
        if x.norm_squared() < BARY_EPS {
            return None;
        }
        for (i, face) in self.faces.iter().enumerate() {
            let Some((bary, k)) = cart2bary(x, face) else {
                continue;
            };
            if bary.x < -BARY_EPS || bary.y < -BARY_EPS || bary.z < -BARY_EPS || k < 0.0 {
                continue;
            }
            return Some((i, bary, k));
        }
        // A nonzero ray always pierces some face.
        debug_assert!(false, "barycentric lookup missed every face: {x:?}");
        None
    }
}

/// Moller-Trumbore ray/triangle intersection giving barycentric coordinates.
/// Returns `None` when the determinant is too small to invert stably.
fn cart2bary(cart: &Vector3<f64>, tri: &Face) -> Option<(Vector3<f64>, f64)> {
    let e1 = tri.v[1] - tri.v[0];
    let e2 = tri.v[2] - tri.v[0];
    let p = cart.cross(&e2);
    let det = e1.dot(&p);

    if det.abs() < BARY_EPS {
        return None;
    }
    let det_inv = 1.0 / det;

    let t = -tri.v[0];
    let q = t.cross(&e1);

    let b = det_inv * t.dot(&p);
    let c = det_inv * cart.dot(&q);
    let a = 1.0 - b - c;
    let k = e2.dot(&q) * det_inv;

    debug_assert!(!(a.is_nan() || b.is_nan() || c.is_nan()));
    Some((Vector3::new(a, b, c), k))
}
