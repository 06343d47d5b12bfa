//! Command-line driver: detect keypoints and extract descriptors from raw
//! f32 volumes, optionally matching a second volume against the first.
//!
//! ```text
//! sift3d --dims 64x64x64 [sift options] input.f32 keys.csv desc.csv \
//!        [input2.f32 matches1.csv matches2.csv]
//! ```
//!
//! Input volumes are little-endian f32 buffers in x-major order. See
//! `--help` for the detector options.

use std::process::ExitCode;

use sift3d_features::{match_coords, Sift3d, Volume, OPTS_HELP};

fn read_volume(path: &str, nx: usize, ny: usize, nz: usize) -> Result<Volume, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("{path}: {e}"))?;
    if bytes.len() != nx * ny * nz * 4 {
        return Err(format!(
            "{path}: expected {} bytes for {nx}x{ny}x{nz} f32 voxels, got {}",
            nx * ny * nz * 4,
            bytes.len()
        ));
    }
    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Volume::from_raw(nx, ny, nz, data))
}

fn parse_dims(spec: &str) -> Result<(usize, usize, usize), String> {
    let parts: Vec<usize> = spec
        .split('x')
        .map(|p| p.parse().map_err(|_| format!("bad dimension {p:?}")))
        .collect::<Result<_, _>>()?;
    match parts[..] {
        [nx, ny, nz] => Ok((nx, ny, nz)),
        _ => Err(format!("bad --dims {spec:?}, expected NXxNYxNZ")),
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("usage: sift3d --dims NXxNYxNZ [options] in.f32 keys.csv desc.csv");
        println!("       [in2.f32 matches1.csv matches2.csv]");
        println!();
        println!("{OPTS_HELP}");
        return Ok(());
    }

    // Pull out the driver's own --dims option before the strict detector
    // option pass sees it.
    let mut dims = None;
    let mut detector_args = Vec::new();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if arg == "--dims" {
            let spec = it.next().ok_or("--dims expects NXxNYxNZ")?;
            dims = Some(parse_dims(&spec)?);
        } else {
            detector_args.push(arg);
        }
    }
    let (nx, ny, nz) = dims.ok_or("missing required --dims NXxNYxNZ")?;

    let mut sift = Sift3d::new();
    let positional = sift
        .parse_args(&detector_args, true)
        .map_err(|e| e.to_string())?;

    let [input, keys_out, desc_out, extra @ ..] = &positional[..] else {
        return Err("expected input.f32 keys.csv desc.csv".into());
    };

    let im = read_volume(input, nx, ny, nz)?;
    let mut keypoints = Vec::new();
    sift.detect_keypoints(&im, &mut keypoints)
        .map_err(|e| e.to_string())?;
    let desc = sift
        .extract_descriptors(&keypoints)
        .map_err(|e| e.to_string())?;
    eprintln!("{input}: {} keypoints", keypoints.len());

    sift3d_features::write_keypoints(keys_out, &keypoints).map_err(|e| e.to_string())?;
    sift3d_features::write_descriptors(desc_out, &desc).map_err(|e| e.to_string())?;

    match extra {
        [] => Ok(()),
        [input2, match1_out, match2_out] => {
            let im2 = read_volume(input2, nx, ny, nz)?;
            let mut keypoints2 = Vec::new();
            sift.detect_keypoints(&im2, &mut keypoints2)
                .map_err(|e| e.to_string())?;
            let desc2 = sift
                .extract_descriptors(&keypoints2)
                .map_err(|e| e.to_string())?;
            eprintln!("{input2}: {} keypoints", keypoints2.len());

            let matches = sift
                .match_descriptors_fb(&desc, &desc2, 0.8)
                .map_err(|e| e.to_string())?;
            let (left, right) = match_coords(&desc, &desc2, &matches);
            eprintln!("{} matches", left.len());
            sift3d_features::write_match_coords(match1_out, &left).map_err(|e| e.to_string())?;
            sift3d_features::write_match_coords(match2_out, &right).map_err(|e| e.to_string())?;
            Ok(())
        }
        _ => Err("expected either no extra arguments or input2.f32 matches1.csv matches2.csv".into()),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("sift3d: {msg}");
            ExitCode::FAILURE
        }
    }
}
