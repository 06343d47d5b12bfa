//! CSV persistence for keypoints, descriptors and match coordinates.
//!
//! Values are written with the shortest round-trip representation, so a
//! write/read cycle reproduces every coordinate and bin exactly.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use itertools::Itertools;
use nalgebra::Matrix3;

use crate::descriptor::{Descriptor, DescriptorStore};
use crate::keypoint::Keypoint;
use crate::{Error, Result};

/// Keypoint rows carry the position, the scale, and the row-major
/// orientation matrix.
const KP_NUM_COLS: usize = 13;

fn parse_row(path: &Path, line_no: usize, line: &str) -> Result<Vec<f64>> {
    line.split(',')
        .map(|field| {
            field.trim().parse::<f64>().map_err(|_| Error::Malformed {
                path: path.to_path_buf(),
                line: line_no,
                what: format!("not a number: {field:?}"),
            })
        })
        .collect()
}

/// Write a keypoint store as CSV, one row per keypoint:
/// `x, y, z, s, R00, R01, ..., R22`, with coordinates scaled to the base
/// octave.
pub fn write_keypoints<P: AsRef<Path>>(path: P, keypoints: &[Keypoint]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path.as_ref())?);
    for key in keypoints {
        let f = key.coord_factor();
        write!(w, "{},{},{},{}", key.xd * f, key.yd * f, key.zd * f, key.sd)?;
        for i in 0..3 {
            for j in 0..3 {
                write!(w, ",{}", key.r[(i, j)])?;
            }
        }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

/// Read a keypoint CSV written by [`write_keypoints`]. Positions are in
/// base-octave coordinates, so the keypoints come back at octave 0.
pub fn read_keypoints<P: AsRef<Path>>(path: P) -> Result<Vec<Keypoint>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut keypoints = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let row = parse_row(path, line_no + 1, &line)?;
        if row.len() != KP_NUM_COLS {
            return Err(Error::Malformed {
                path: path.to_path_buf(),
                line: line_no + 1,
                what: format!("expected {KP_NUM_COLS} columns, got {}", row.len()),
            });
        }
        let mut r = Matrix3::zeros();
        for i in 0..3 {
            for j in 0..3 {
                r[(i, j)] = row[4 + i * 3 + j];
            }
        }
        keypoints.push(Keypoint {
            o: 0,
            s: 0,
            xi: row[0].floor().max(0.0) as usize,
            yi: row[1].floor().max(0.0) as usize,
            zi: row[2].floor().max(0.0) as usize,
            xd: row[0],
            yd: row[1],
            zd: row[2],
            sd: row[3],
            sd_rel: row[3],
            r,
        });
    }
    Ok(keypoints)
}

/// Write a descriptor store as CSV, one row of bin values per descriptor.
pub fn write_descriptors<P: AsRef<Path>>(path: P, store: &DescriptorStore) -> Result<()> {
    let mut w = BufWriter::new(File::create(path.as_ref())?);
    for desc in &store.descriptors {
        writeln!(w, "{}", desc.bins.iter().format(","))?;
    }
    w.flush()?;
    Ok(())
}

/// Read a descriptor CSV written by [`write_descriptors`]. Only the bins
/// are persisted; locations and volume dimensions come back zeroed.
pub fn read_descriptors<P: AsRef<Path>>(path: P) -> Result<DescriptorStore> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut descriptors = Vec::new();
    let mut width = None;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let row = parse_row(path, line_no + 1, &line)?;
        match width {
            None => width = Some(row.len()),
            Some(w) if w != row.len() => {
                return Err(Error::Malformed {
                    path: path.to_path_buf(),
                    line: line_no + 1,
                    what: format!("expected {w} columns, got {}", row.len()),
                });
            }
            _ => {}
        }
        descriptors.push(Descriptor {
            xd: 0.0,
            yd: 0.0,
            zd: 0.0,
            sd: 0.0,
            bins: row.into_iter().map(|v| v as f32).collect(),
        });
    }
    Ok(DescriptorStore {
        nx: 0,
        ny: 0,
        nz: 0,
        descriptors,
    })
}

/// Write one side of a match-pair file: an `n x 3` coordinate matrix with
/// the same row order as its counterpart.
pub fn write_match_coords<P: AsRef<Path>>(path: P, coords: &[[f64; 3]]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path.as_ref())?);
    for row in coords {
        writeln!(w, "{},{},{}", row[0], row[1], row[2])?;
    }
    w.flush()?;
    Ok(())
}
