//! Versioned binary mesh cache.
//!
//! Layout mirrors the serialized fields of [`crate::mesh::Model`]: a u16
//! source checksum and u16 format version up front, then the per-vertex
//! arrays, face data, reorder permutations, optional second UV channel, and
//! bounds/metrics. All fields are little-endian. A version bump invalidates
//! every cache in the wild; readers fall back to re-parsing the source.

use std::path::Path;

use anyhow::Result;
use glam::Vec3;
use tracing::{debug, warn};

use crate::mesh::Model;
use crate::paths;

/// Bump when the serialized layout changes.
pub const MODEL_CACHE_VERSION: u16 = 1;

pub fn write(path: &Path, model: &Model) -> Result<()> {
    let mut out = Vec::new();
    put_u16(&mut out, model.checksum);
    put_u16(&mut out, MODEL_CACHE_VERSION);

    let vc = model.vertex_count();
    put_i32(&mut out, vc as i32);
    put_f32s(&mut out, &model.vertices);
    put_f32s(&mut out, &model.normals);
    put_f32s(&mut out, &model.tangents);
    put_f32s(&mut out, &model.bitangents);
    put_f32s(&mut out, &model.tex_coords);

    let fc = model.face_count();
    put_i32(&mut out, fc as i32);
    for &f in &model.faces {
        put_u32(&mut out, f);
    }
    for n in &model.face_normals {
        put_vec3(&mut out, *n);
    }

    put_i32(&mut out, model.precollapse_num_vertices as i32);
    put_i32(&mut out, model.precollapse_vert_reorder.len() as i32);
    for &v in &model.precollapse_vert_reorder {
        put_u32(&mut out, v);
    }
    put_i32(&mut out, model.optimize_vert_reorder.len() as i32);
    for &v in &model.optimize_vert_reorder {
        put_u32(&mut out, v);
    }

    let uv2_count = model.tex_coords2.len() / 2;
    put_i32(&mut out, uv2_count as i32);
    if uv2_count > 0 {
        put_f32s(&mut out, &model.tex_coords2);
    }

    put_vec3(&mut out, model.min_coords);
    put_vec3(&mut out, model.max_coords);
    put_vec3(&mut out, model.center_coords);
    put_vec3(&mut out, model.old_center);
    put_vec3(&mut out, model.bounding_sphere_origin);
    put_f32(&mut out, model.bounding_sphere_radius);

    put_f32(&mut out, model.texel_density);
    put_f32(&mut out, model.average_triangle_edge_length);

    paths::atomic_replace(path, &out)
}

/// Read a cache back; `None` when the file is absent, truncated, or its
/// checksum/version no longer match the source.
pub fn read(path: &Path, expected_checksum: u16) -> Option<Model> {
    let bytes = std::fs::read(path).ok()?;
    let mut r = ByteReader::new(&bytes);

    let checksum = r.u16()?;
    let version = r.u16()?;
    if checksum != expected_checksum {
        debug!("cache {} is stale (checksum mismatch)", path.display());
        return None;
    }
    if version != MODEL_CACHE_VERSION {
        debug!(
            "cache {} has format version {version}, expected {MODEL_CACHE_VERSION}",
            path.display()
        );
        return None;
    }

    let model = parse_model(&mut r, checksum);
    if model.is_none() {
        warn!("cache {} is truncated or corrupt, re-parsing source", path.display());
    }
    model
}

fn parse_model(r: &mut ByteReader<'_>, checksum: u16) -> Option<Model> {
    let mut model = Model {
        checksum,
        ..Model::default()
    };

    let vc = r.i32()? as usize;
    model.vertices = r.f32s(vc * 3)?;
    model.normals = r.f32s(vc * 3)?;
    model.tangents = r.f32s(vc * 3)?;
    model.bitangents = r.f32s(vc * 3)?;
    model.tex_coords = r.f32s(vc * 2)?;

    let fc = r.i32()? as usize;
    model.faces = r.u32s(fc * 3)?;
    model.face_normals = (0..fc).map(|_| r.vec3()).collect::<Option<_>>()?;

    model.precollapse_num_vertices = r.i32()? as u32;
    let n = r.i32()? as usize;
    model.precollapse_vert_reorder = r.u32s(n)?;
    let n = r.i32()? as usize;
    model.optimize_vert_reorder = r.u32s(n)?;

    let uv2_count = r.i32()? as usize;
    if uv2_count > 0 {
        model.tex_coords2 = r.f32s(uv2_count * 2)?;
    }

    model.min_coords = r.vec3()?;
    model.max_coords = r.vec3()?;
    model.center_coords = r.vec3()?;
    model.old_center = r.vec3()?;
    model.bounding_sphere_origin = r.vec3()?;
    model.bounding_sphere_radius = r.f32()?;

    model.texel_density = r.f32()?;
    model.average_triangle_edge_length = r.f32()?;
    Some(model)
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f32s(out: &mut Vec<u8>, vs: &[f32]) {
    for &v in vs {
        put_f32(out, v);
    }
}

fn put_vec3(out: &mut Vec<u8>, v: Vec3) {
    put_f32(out, v.x);
    put_f32(out, v.y);
    put_f32(out, v.z);
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.bytes.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Option<i32> {
        self.take(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Option<f32> {
        self.take(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32s(&mut self, n: usize) -> Option<Vec<f32>> {
        (0..n).map(|_| self.f32()).collect()
    }

    fn u32s(&mut self, n: usize) -> Option<Vec<u32>> {
        (0..n).map(|_| self.u32()).collect()
    }

    fn vec3(&mut self) -> Option<Vec3> {
        Some(Vec3::new(self.f32()?, self.f32()?, self.f32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_model() -> Model {
        Model {
            vertices: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            normals: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            tangents: vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            bitangents: vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0],
            tex_coords: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            tex_coords2: vec![0.5, 0.5, 0.5, 0.5, 0.5, 0.5],
            faces: vec![0, 1, 2],
            face_normals: vec![Vec3::Z],
            min_coords: Vec3::ZERO,
            max_coords: Vec3::new(1.0, 1.0, 0.0),
            center_coords: Vec3::new(0.5, 0.5, 0.0),
            old_center: Vec3::new(0.5, 0.5, 0.0),
            bounding_sphere_origin: Vec3::new(0.5, 0.5, 0.0),
            bounding_sphere_radius: 0.71,
            texel_density: 1.0,
            average_triangle_edge_length: 1.14,
            precollapse_num_vertices: 3,
            precollapse_vert_reorder: vec![0, 1, 2],
            optimize_vert_reorder: vec![0, 1, 2],
            checksum: 0xBEEF,
            ..Model::default()
        }
    }

    #[test]
    fn round_trip_preserves_every_serialized_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tri.obj.cache");
        let model = sample_model();
        write(&path, &model).unwrap();

        let loaded = read(&path, 0xBEEF).unwrap();
        assert_eq!(loaded.vertices, model.vertices);
        assert_eq!(loaded.normals, model.normals);
        assert_eq!(loaded.tangents, model.tangents);
        assert_eq!(loaded.bitangents, model.bitangents);
        assert_eq!(loaded.tex_coords, model.tex_coords);
        assert_eq!(loaded.tex_coords2, model.tex_coords2);
        assert_eq!(loaded.faces, model.faces);
        assert_eq!(loaded.face_normals, model.face_normals);
        assert_eq!(loaded.precollapse_num_vertices, model.precollapse_num_vertices);
        assert_eq!(loaded.precollapse_vert_reorder, model.precollapse_vert_reorder);
        assert_eq!(loaded.optimize_vert_reorder, model.optimize_vert_reorder);
        assert_eq!(loaded.min_coords, model.min_coords);
        assert_eq!(loaded.max_coords, model.max_coords);
        assert_eq!(loaded.bounding_sphere_origin, model.bounding_sphere_origin);
        assert_eq!(loaded.bounding_sphere_radius, model.bounding_sphere_radius);
        assert_eq!(loaded.texel_density, model.texel_density);
        assert_eq!(
            loaded.average_triangle_edge_length,
            model.average_triangle_edge_length
        );
        assert_eq!(loaded.checksum, 0xBEEF);
    }

    #[test]
    fn checksum_mismatch_rejects_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tri.obj.cache");
        write(&path, &sample_model()).unwrap();
        assert!(read(&path, 0x1234).is_none());
    }

    #[test]
    fn version_mismatch_rejects_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tri.obj.cache");
        write(&path, &sample_model()).unwrap();

        // Flip the stored version in place.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[2] = bytes[2].wrapping_add(1);
        std::fs::write(&path, &bytes).unwrap();
        assert!(read(&path, 0xBEEF).is_none());
    }

    #[test]
    fn truncated_cache_rejects() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tri.obj.cache");
        write(&path, &sample_model()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(read(&path, 0xBEEF).is_none());
    }
}
