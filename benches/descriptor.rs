use divan::{black_box, Bencher};
use sift3d_features::{Sift3d, Volume};

fn main() {
    divan::main();
}

fn scene(n: usize) -> Volume {
    let c = n as f64 / 2.0;
    Volume::from_fn(n, n, n, |x, y, z| {
        let px = x as f64 + 0.5 - c;
        let py = y as f64 + 0.5 - c;
        let pz = z as f64 + 0.5 - c;
        let dx = px - 4.0;
        let mut v = (-0.5 * ((dx / 3.2).powi(2) + (py / 2.2).powi(2) + (pz / 2.7).powi(2))).exp();
        v += 0.5 * (-0.5 * ((px - 8.0).powi(2) + (py - 2.0).powi(2) + pz.powi(2)) / 2.25).exp();
        v as f32
    })
}

#[divan::bench(sample_count = 50)]
fn extract_descriptors(bencher: Bencher) {
    let im = scene(48);
    let mut sift = Sift3d::new();
    sift.set_corner_thresh(0.0).unwrap();
    let mut keypoints = Vec::new();
    sift.detect_keypoints(&im, &mut keypoints).unwrap();
    assert!(!keypoints.is_empty());

    bencher.bench_local(|| black_box(sift.extract_descriptors(black_box(&keypoints)).unwrap()));
}

#[divan::bench(sample_count = 5)]
fn dense_descriptors(bencher: Bencher) {
    let im = scene(24);
    let sift = Sift3d::new();
    bencher.bench_local(|| black_box(sift.extract_dense_descriptors(black_box(&im)).unwrap()));
}
