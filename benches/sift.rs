use divan::{black_box, Bencher};
use sift3d_features::{Sift3d, Volume};

fn main() {
    divan::main();
}

/// Asymmetric multi-blob volume, structured enough to exercise every
/// pipeline stage.
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

#[divan::bench(sample_count = 10)]
fn build_pyramids_and_detect(bencher: Bencher) {
    let im = scene(48);
    bencher.bench_local(|| {
        let mut sift = Sift3d::new();
        let mut keypoints = Vec::new();
        sift.detect_keypoints(black_box(&im), &mut keypoints).unwrap();
        black_box(keypoints.len())
    });
}

#[divan::bench(sample_count = 10)]
fn detect_and_describe(bencher: Bencher) {
    let im = scene(48);
    bencher.bench_local(|| {
        let mut sift = Sift3d::new();
        sift.set_corner_thresh(0.0).unwrap();
        let mut keypoints = Vec::new();
        sift.detect_keypoints(black_box(&im), &mut keypoints).unwrap();
        let desc = sift.extract_descriptors(&keypoints).unwrap();
        black_box(desc.descriptors.len())
    });
}
