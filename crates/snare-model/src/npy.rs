//! Minimal NumPy `.npy` / `.npz` codec for f32 tensors.
//!
//! Only the subset this toolkit emits and consumes is supported:
//! format version 1.0, dtype `<f4`, C-order. An `.npz` is a zip archive
//! of `.npy` members, one per named tensor, readable by
//! `numpy.load` on the Python side.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use snare_core::{Result, SnareError};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MAGIC: &[u8; 6] = b"\x93NUMPY";

fn io_err(e: impl std::fmt::Display) -> SnareError {
    SnareError::ArtifactIo(e.to_string())
}

/// Serialize a tensor in `.npy` v1.0 layout.
pub fn write_npy<W: Write>(w: &mut W, arr: &ArrayD<f32>) -> Result<()> {
    let shape = arr
        .shape()
        .iter()
        .map(|d| format!("{d},"))
        .collect::<String>();
    // Trailing comma is required for 1-tuples and harmless otherwise,
    // except numpy prints "(2, 3)" -- both parse fine, keep it simple.
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}), }}",
        shape.trim_end_matches(',').replace(',', ", ")
            + if arr.ndim() == 1 { "," } else { "" }
    );
    // Pad so the data section starts 64-byte aligned.
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(pad));
    header.push('\n');

    w.write_all(MAGIC).map_err(io_err)?;
    w.write_all(&[0x01, 0x00]).map_err(io_err)?;
    w.write_all(&(header.len() as u16).to_le_bytes())
        .map_err(io_err)?;
    w.write_all(header.as_bytes()).map_err(io_err)?;

    let standard = arr.as_standard_layout();
    let mut buf = Vec::with_capacity(standard.len() * 4);
    for &v in standard.iter() {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    w.write_all(&buf).map_err(io_err)?;
    Ok(())
}

/// Deserialize an `.npy` v1.0 f32 tensor.
pub fn read_npy<R: Read>(r: &mut R) -> Result<ArrayD<f32>> {
    let mut magic = [0u8; 6];
    r.read_exact(&mut magic).map_err(io_err)?;
    if &magic != MAGIC {
        return Err(SnareError::ArtifactIo("not an npy file".to_string()));
    }
    let mut version = [0u8; 2];
    r.read_exact(&mut version).map_err(io_err)?;
    if version[0] != 1 {
        return Err(SnareError::ArtifactIo(format!(
            "unsupported npy version {}.{}",
            version[0], version[1]
        )));
    }
    let mut len_bytes = [0u8; 2];
    r.read_exact(&mut len_bytes).map_err(io_err)?;
    let header_len = u16::from_le_bytes(len_bytes) as usize;
    let mut header = vec![0u8; header_len];
    r.read_exact(&mut header).map_err(io_err)?;
    let header = String::from_utf8(header)
        .map_err(|_| SnareError::ArtifactIo("npy header is not utf-8".to_string()))?;

    if !header.contains("'<f4'") {
        return Err(SnareError::ArtifactIo(format!(
            "unsupported npy dtype in header: {}",
            header.trim()
        )));
    }
    if header.contains("'fortran_order': True") {
        return Err(SnareError::ArtifactIo(
            "fortran-order npy is not supported".to_string(),
        ));
    }
    let shape = parse_shape(&header)?;

    let count: usize = shape.iter().product();
    let mut data = vec![0u8; count * 4];
    r.read_exact(&mut data).map_err(io_err)?;
    let values = data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<_>>();
    ArrayD::from_shape_vec(IxDyn(&shape), values)
        .map_err(|e| SnareError::ArtifactIo(e.to_string()))
}

fn parse_shape(header: &str) -> Result<Vec<usize>> {
    let start = header
        .find("'shape':")
        .and_then(|i| header[i..].find('(').map(|j| i + j + 1))
        .ok_or_else(|| SnareError::ArtifactIo("npy header missing shape".to_string()))?;
    let end = header[start..]
        .find(')')
        .map(|j| start + j)
        .ok_or_else(|| SnareError::ArtifactIo("npy header missing shape".to_string()))?;
    header[start..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| SnareError::ArtifactIo(format!("bad npy shape entry: {s}")))
        })
        .collect()
}

/// Write named tensors as an `.npz` archive (zip of `.npy` members).
pub fn write_npz(path: &Path, entries: &BTreeMap<String, ArrayD<f32>>) -> Result<()> {
    let file = File::create(path).map_err(io_err)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, arr) in entries {
        zip.start_file(format!("{name}.npy"), options)
            .map_err(io_err)?;
        write_npy(&mut zip, arr)?;
    }
    zip.finish().map_err(io_err)?;
    Ok(())
}

/// Read every tensor from an `.npz` archive, keyed by member name with the
/// `.npy` suffix stripped.
pub fn read_npz(path: &Path) -> Result<BTreeMap<String, ArrayD<f32>>> {
    let file = File::open(path).map_err(io_err)?;
    let mut zip = ZipArchive::new(file).map_err(io_err)?;
    let mut out = BTreeMap::new();
    for i in 0..zip.len() {
        let mut member = zip.by_index(i).map_err(io_err)?;
        let name = member
            .name()
            .strip_suffix(".npy")
            .unwrap_or(member.name())
            .to_string();
        let arr = read_npy(&mut member)?;
        out.insert(name, arr);
    }
    Ok(out)
}
