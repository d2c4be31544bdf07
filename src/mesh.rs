//! Runtime mesh conditioning: OBJ-subset parsing, vertex welding,
//! degenerate pruning, vertex-cache-aware triangle reordering, and the
//! derived geometry (normals, tangent basis, bounds, density metrics) that
//! the renderer consumes.
//!
//! A conditioned mesh is persisted beside its source as a checksummed binary
//! cache (`mesh_cache`); subsequent loads skip everything below when the
//! cache still matches.

use std::path::{Path, PathBuf};

use glam::Vec3;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::hash::checksum16;
use crate::mesh_cache;
use crate::paths;

/// Post-transform vertex cache size the triangle reorder optimizes for.
pub const VERTEX_CACHE_SIZE: usize = 32;

const CACHE_DECAY_POWER: f32 = 1.5;
const LAST_TRI_SCORE: f32 = 0.75;
const VALENCE_BOOST_SCALE: f32 = 2.0;
const VALENCE_BOOST_POWER: f32 = 0.5;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadFlags {
    /// Translate the model so its bounding-box center sits at the origin.
    pub center: bool,
    /// Skip normal/tangent computation; geometry only.
    pub simple: bool,
    /// Reverse the winding of every face.
    pub flip_faces: bool,
    /// Mesh uses a tangent basis; welding then keys on normals too.
    pub use_tangent: bool,
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("failed to read model {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("more than one object in source file, incompatible with loader")]
    MoreThanOneObject,
}

/// Parallel per-vertex arrays plus the face index stream. Array lengths are
/// always `vertex_count * components` or zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    pub vertices: Vec<f32>,    // 3 per vertex
    pub normals: Vec<f32>,     // 3 per vertex
    pub tangents: Vec<f32>,    // 3 per vertex
    pub bitangents: Vec<f32>,  // 3 per vertex
    pub tex_coords: Vec<f32>,  // 2 per vertex
    pub tex_coords2: Vec<f32>, // 2 per vertex, optional second channel
    pub aux: Vec<f32>,         // 3 per vertex
    pub bone_weights: Vec<f32>, // 4 per vertex
    pub bone_ids: Vec<f32>,     // 4 per vertex
    pub faces: Vec<u32>,
    pub face_normals: Vec<Vec3>,

    pub min_coords: Vec3,
    pub max_coords: Vec3,
    pub center_coords: Vec3,
    pub old_center: Vec3,
    pub bounding_sphere_origin: Vec3,
    pub bounding_sphere_radius: f32,

    pub texel_density: f32,
    pub average_triangle_edge_length: f32,

    /// Vertex count before welding collapsed duplicates.
    pub precollapse_num_vertices: u32,
    /// New-to-old vertex mapping recorded by the welding pass.
    pub precollapse_vert_reorder: Vec<u32>,
    /// New-to-old vertex mapping recorded by the post-cache reorder pass.
    pub optimize_vert_reorder: Vec<u32>,

    /// 16-bit checksum of the source file, pairing it with its cache.
    pub checksum: u16,
    pub path: String,

    pub use_tangent: bool,
}

impl Model {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn face_count(&self) -> usize {
        self.faces.len() / 3
    }

    /// Load a model relative to `root`, preferring the sibling binary cache
    /// when its checksum and format version still match the source.
    pub fn load(root: &Path, rel_path: &str, flags: LoadFlags) -> Result<Model, MeshError> {
        let rel = paths::normalize_rel(rel_path);
        let abs = paths::assemble(root, &rel);
        let bytes = std::fs::read(&abs).map_err(|source| MeshError::Io {
            path: abs.clone(),
            source,
        })?;
        let checksum = checksum16(&bytes);
        let cache_path = paths::assemble(root, &format!("{rel}.cache"));

        if let Some(mut cached) = mesh_cache::read(&cache_path, checksum) {
            debug!("loaded {rel} from cache");
            cached.path = rel;
            cached.checksum = checksum;
            cached.use_tangent = flags.use_tangent;
            return Ok(cached);
        }

        let text = String::from_utf8_lossy(&bytes);
        let mut model = parse_triangle_cut_obj(&text)?;
        model.path = rel.clone();
        model.checksum = checksum;
        model.use_tangent = flags.use_tangent;
        model.precollapse_num_vertices = model.vertex_count() as u32;

        // Optional second UV channel from a `<name>_UV2` sibling.
        let uv2_rel = format!("{rel}_UV2");
        let uv2_abs = paths::assemble(root, &uv2_rel);
        if uv2_abs.exists() {
            match std::fs::read_to_string(&uv2_abs) {
                Ok(uv2_text) => match parse_triangle_cut_obj(&uv2_text) {
                    Ok(uv2_model) => {
                        if uv2_model.vertices.len() != model.vertices.len() {
                            error!(
                                "mismatched number of vertices in {uv2_rel}, will not use data"
                            );
                        } else {
                            let len = model.tex_coords2.len();
                            model.tex_coords2.copy_from_slice(&uv2_model.tex_coords[..len]);
                        }
                    }
                    Err(e) => error!("malformed data in {uv2_rel}: {e}, will not use data"),
                },
                Err(e) => error!("could not read {uv2_rel}: {e}"),
            }
        }

        if flags.flip_faces {
            for tri in model.faces.chunks_exact_mut(3) {
                tri.swap(0, 2);
            }
        }

        if !flags.simple {
            if model.normals.is_empty() {
                model.calc_normals();
            } else {
                model.calc_face_normals();
                for n in model.normals.chunks_exact_mut(3) {
                    let length = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
                    if length != 0.0 {
                        n[0] /= length;
                        n[1] /= length;
                        n[2] /= length;
                    }
                }
            }
            model.calc_tangents();
        } else {
            model.tex_coords.clear();
            model.tex_coords.resize(model.vertices.len() / 3 * 2, 0.0);
            model.normals.clear();
            model.normals.resize(model.vertices.len(), 0.0);
            model.calc_face_normals();
        }

        model.calc_bounding_box();
        model.old_center = model.center_coords;
        if flags.center {
            model.center_model();
        }
        model.calc_bounding_sphere();
        model.calc_texel_density();
        model.calc_average_triangle_edge();

        model.remove_duplicated_verts();
        model.remove_degenerate_triangles();
        model.optimize_triangle_order();
        model.optimize_vertex_order();

        if let Err(e) = mesh_cache::write(&cache_path, &model) {
            warn!("could not write mesh cache {}: {e}", cache_path.display());
        }

        Ok(model)
    }

    // ── Derived geometry ─────────────────────────────────────────────────

    pub fn calc_face_normals(&mut self) {
        self.face_normals.clear();
        self.face_normals.reserve(self.face_count());
        for tri in self.faces.chunks_exact(3) {
            let p0 = self.vert(tri[0]);
            let p1 = self.vert(tri[1]);
            let p2 = self.vert(tri[2]);
            self.face_normals.push((p1 - p0).cross(p2 - p0));
        }
    }

    /// Per-vertex normals by summing incident face normals, then
    /// renormalizing both.
    pub fn calc_normals(&mut self) {
        self.normals.clear();
        self.normals.resize(self.vertices.len(), 0.0);
        self.calc_face_normals();

        for (i, tri) in self.faces.chunks_exact(3).enumerate() {
            let fnorm = self.face_normals[i];
            for &v in tri {
                let base = v as usize * 3;
                self.normals[base] += fnorm.x;
                self.normals[base + 1] += fnorm.y;
                self.normals[base + 2] += fnorm.z;
            }
        }

        // Zero-length sums happen on degenerate fans; they must not turn
        // into NaN.
        for n in self.normals.chunks_exact_mut(3) {
            let length = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            if length != 0.0 {
                n[0] /= length;
                n[1] /= length;
                n[2] /= length;
            }
        }
        for fnorm in &mut self.face_normals {
            *fnorm = fnorm.normalize_or_zero();
        }
    }

    /// Texture-gradient tangent basis, Gram-Schmidt orthonormalized against
    /// the vertex normal.
    pub fn calc_tangents(&mut self) {
        self.tangents.clear();
        self.tangents.resize(self.vertices.len(), 0.0);
        self.bitangents.clear();
        self.bitangents.resize(self.vertices.len(), 0.0);
        if self.tex_coords.is_empty() {
            return;
        }

        for tri in self.faces.chunks_exact(3) {
            let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
            let p0 = self.vert(tri[0]);
            let e1 = self.vert(tri[1]) - p0;
            let e2 = self.vert(tri[2]) - p0;

            let s1 = self.tex_coords[i1 * 2] - self.tex_coords[i0 * 2];
            let s2 = self.tex_coords[i2 * 2] - self.tex_coords[i0 * 2];
            let t1 = self.tex_coords[i1 * 2 + 1] - self.tex_coords[i0 * 2 + 1];
            let t2 = self.tex_coords[i2 * 2 + 1] - self.tex_coords[i0 * 2 + 1];

            let denom = s1 * t2 - s2 * t1;
            let r = if denom != 0.0 { 1.0 / denom } else { 99999.0 };
            let sdir = (e1 * t2 - e2 * t1) * r;
            let tdir = (e2 * s1 - e1 * s2) * r;

            for &v in tri {
                let base = v as usize * 3;
                self.tangents[base] += sdir.x;
                self.tangents[base + 1] += sdir.y;
                self.tangents[base + 2] += sdir.z;
                self.bitangents[base] += tdir.x;
                self.bitangents[base + 1] += tdir.y;
                self.bitangents[base + 2] += tdir.z;
            }
        }

        for i in 0..self.vertex_count() {
            let n = Vec3::new(
                self.normals[i * 3],
                self.normals[i * 3 + 1],
                self.normals[i * 3 + 2],
            );
            for arr in [&mut self.tangents, &mut self.bitangents] {
                let t = Vec3::new(arr[i * 3], arr[i * 3 + 1], arr[i * 3 + 2]);
                let ortho = (t - n * n.dot(t)).normalize_or_zero();
                arr[i * 3] = ortho.x;
                arr[i * 3 + 1] = ortho.y;
                arr[i * 3 + 2] = ortho.z;
            }
        }
    }

    pub fn calc_bounding_box(&mut self) {
        self.min_coords = Vec3::ZERO;
        self.max_coords = Vec3::ZERO;
        for (i, v) in self.vertices.chunks_exact(3).enumerate() {
            let p = Vec3::new(v[0], v[1], v[2]);
            if i == 0 {
                self.min_coords = p;
                self.max_coords = p;
            } else {
                self.min_coords = self.min_coords.min(p);
                self.max_coords = self.max_coords.max(p);
            }
        }
        self.center_coords = (self.min_coords + self.max_coords) / 2.0;
    }

    /// Requires an up-to-date bounding box.
    pub fn center_model(&mut self) {
        let c = self.center_coords;
        for v in self.vertices.chunks_exact_mut(3) {
            v[0] -= c.x;
            v[1] -= c.y;
            v[2] -= c.z;
        }
        self.center_coords = Vec3::ZERO;
        self.calc_bounding_box();
    }

    pub fn calc_bounding_sphere(&mut self) {
        self.bounding_sphere_origin = self.center_coords;
        let mut longest = 0.0f32;
        for v in self.vertices.chunks_exact(3) {
            let d = Vec3::new(v[0], v[1], v[2]).distance_squared(self.bounding_sphere_origin);
            if d > longest {
                longest = d;
            }
        }
        self.bounding_sphere_radius = longest.sqrt();
    }

    /// Ratio of texture-space edge length to world-space edge length,
    /// summed over all face edges.
    pub fn calc_texel_density(&mut self) {
        if self.tex_coords.is_empty() {
            self.texel_density = 1.0;
            return;
        }
        let mut total_tex = 0.0f32;
        let mut total_vert = 0.0f32;
        for tri in self.faces.chunks_exact(3) {
            for j in 0..3 {
                let a = tri[j] as usize;
                let b = tri[(j + 1) % 3] as usize;
                let tex_distance = ((self.tex_coords[a * 2] - self.tex_coords[b * 2]).powi(2)
                    + (self.tex_coords[a * 2 + 1] - self.tex_coords[b * 2 + 1]).powi(2))
                .sqrt();
                let vert_distance = self.vert(tri[j]).distance(self.vert(tri[(j + 1) % 3]));
                if vert_distance != 0.0 {
                    total_tex += tex_distance;
                    total_vert += vert_distance;
                }
            }
        }
        self.texel_density = if total_vert != 0.0 {
            total_tex / total_vert
        } else {
            1.0
        };
    }

    pub fn calc_average_triangle_edge(&mut self) {
        let mut total = 0.0f32;
        let mut samples = 0usize;
        for tri in self.faces.chunks_exact(3) {
            for j in 0..3 {
                let d = self.vert(tri[j]).distance(self.vert(tri[(j + 1) % 3]));
                if d != 0.0 {
                    samples += 1;
                    total += d;
                }
            }
        }
        self.average_triangle_edge_length = if samples > 0 {
            total / samples as f32
        } else {
            1.0
        };
    }

    #[inline]
    fn vert(&self, index: u32) -> Vec3 {
        let base = index as usize * 3;
        Vec3::new(
            self.vertices[base],
            self.vertices[base + 1],
            self.vertices[base + 2],
        )
    }

    // ── Welding ──────────────────────────────────────────────────────────

    /// Collapse vertices that share `(position, normal-if-tangent, uv0)` to
    /// numerical equality, rewriting face indices and recording the new->old
    /// permutation in `precollapse_vert_reorder`.
    pub fn remove_duplicated_verts(&mut self) {
        if self.vertices.is_empty() {
            warn!("welding called on an empty mesh");
            return;
        }

        #[derive(Clone)]
        struct VertInfo {
            entries: [f32; 8],
            old_id: u32,
        }

        let count = self.vertex_count();
        let mut vert_info: Vec<VertInfo> = Vec::with_capacity(count);
        for i in 0..count {
            let mut entries = [0.0f32; 8];
            entries[..3].copy_from_slice(&self.vertices[i * 3..i * 3 + 3]);
            // Only key on normals when the model carries a tangent basis;
            // plain meshes weld across smoothing seams.
            if self.use_tangent && !self.normals.is_empty() {
                entries[3..6].copy_from_slice(&self.normals[i * 3..i * 3 + 3]);
            }
            if !self.tex_coords.is_empty() {
                entries[6..8].copy_from_slice(&self.tex_coords[i * 2..i * 2 + 2]);
            }
            vert_info.push(VertInfo {
                entries,
                old_id: i as u32,
            });
        }

        vert_info.sort_by(|a, b| {
            a.entries
                .iter()
                .zip(b.entries.iter())
                .map(|(x, y)| x.total_cmp(y))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Walk the sorted array assigning each distinct key a new index.
        let mut unique: Vec<usize> = Vec::new();
        let mut new_vert: Vec<u32> = vec![u32::MAX; count];
        for i in 0..vert_info.len() {
            if i == 0 || vert_info[i].entries != vert_info[i - 1].entries {
                unique.push(i);
            }
            new_vert[vert_info[i].old_id as usize] = (unique.len() - 1) as u32;
        }

        self.precollapse_vert_reorder = unique
            .iter()
            .map(|&i| vert_info[i].old_id)
            .collect();
        for face in &mut self.faces {
            *face = new_vert[*face as usize];
        }

        let reorder = self.precollapse_vert_reorder.clone();
        rearrange_vertices(self, &reorder);

        info!(
            "{} of {} vertices are duplicates",
            count - unique.len(),
            count
        );
        info!("new vertex size: {}", self.vertex_count());
    }

    // ── Degenerate pruning ───────────────────────────────────────────────

    /// Drop triangles with a repeated index via two-cursor compaction;
    /// survivors keep their relative order, and face normals compact with
    /// their faces.
    pub fn remove_degenerate_triangles(&mut self) {
        let mut count = 0usize;
        let mut copy_index = 0usize;
        let has_normals = self.face_normals.len() == self.face_count();
        for i in 0..self.face_count() {
            let index = i * 3;
            let (a, b, c) = (
                self.faces[index],
                self.faces[index + 1],
                self.faces[index + 2],
            );
            if a == b || b == c || a == c {
                count += 1;
                continue;
            }
            self.faces[copy_index * 3] = a;
            self.faces[copy_index * 3 + 1] = b;
            self.faces[copy_index * 3 + 2] = c;
            if has_normals {
                self.face_normals[copy_index] = self.face_normals[i];
            }
            copy_index += 1;
        }
        self.faces.truncate(copy_index * 3);
        if has_normals {
            self.face_normals.truncate(copy_index);
        }
        info!("removed {count} degenerate triangles");
    }

    // ── Triangle-order optimization (Forsyth) ────────────────────────────

    /// Reorder triangles for post-transform vertex-cache reuse, after Tom
    /// Forsyth's linear-speed vertex cache optimization. Ties go to the
    /// first-seen triangle.
    pub fn optimize_triangle_order(&mut self) {
        let num_faces = self.face_count();
        if num_faces == 0 {
            return;
        }

        let mut tris: Vec<TriData> = self
            .faces
            .chunks_exact(3)
            .map(|c| TriData {
                added: false,
                score: 0.0,
                verts: [c[0], c[1], c[2]],
            })
            .collect();
        let mut verts: Vec<VertData> = vec![
            VertData {
                cache_pos: -1,
                score: 0.0,
                not_added_triangles: 0,
            };
            self.vertex_count()
        ];
        for tri in &tris {
            for &v in &tri.verts {
                verts[v as usize].not_added_triangles += 1;
            }
        }
        for v in &mut verts {
            v.score = find_vertex_score(v);
        }

        let mut best_triangle = 0usize;
        let mut best_score = 0.0f32;
        for (i, tri) in tris.iter_mut().enumerate() {
            tri.score = verts[tri.verts[0] as usize].score
                + verts[tri.verts[1] as usize].score
                + verts[tri.verts[2] as usize].score;
            if tri.score > best_score {
                best_score = tri.score;
                best_triangle = i;
            }
        }

        // LRU modeled as a fixed array of vertex ids with -1 for empty
        // slots.
        let mut lru: Vec<i64> = vec![-1; VERTEX_CACHE_SIZE];
        let mut draw_list: Vec<usize> = Vec::with_capacity(num_faces);
        while draw_list.len() < num_faces {
            draw_list.push(best_triangle);
            if draw_list.len() == num_faces {
                break;
            }
            tris[best_triangle].added = true;
            let tri_verts = tris[best_triangle].verts;
            for &vert_id in &tri_verts {
                verts[vert_id as usize].not_added_triangles -= 1;
            }

            for &vert_id in &tri_verts {
                // If the vert is already cached, pull it out and slide the
                // later entries down.
                let cp = verts[vert_id as usize].cache_pos;
                if cp != -1 {
                    for j in cp as usize..VERTEX_CACHE_SIZE {
                        if j == VERTEX_CACHE_SIZE - 1 {
                            lru[j] = -1;
                        } else {
                            lru[j] = lru[j + 1];
                            if lru[j] != -1 {
                                verts[lru[j] as usize].cache_pos -= 1;
                            }
                        }
                    }
                }
                // Slide everything up and insert at the front; whatever
                // passes the end falls out of the cache.
                for j in (0..VERTEX_CACHE_SIZE).rev() {
                    if lru[j] != -1 {
                        let moved = lru[j] as usize;
                        verts[moved].cache_pos += 1;
                        if j >= VERTEX_CACHE_SIZE - 1 {
                            verts[moved].cache_pos = -1;
                        }
                        verts[moved].score = find_vertex_score(&verts[moved]);
                    }
                    if j != 0 {
                        lru[j] = lru[j - 1];
                    }
                }
                lru[0] = vert_id as i64;
                verts[vert_id as usize].cache_pos = 0;
                verts[vert_id as usize].score = find_vertex_score(&verts[vert_id as usize]);
            }

            // Full rescan of the not-yet-emitted triangles. Forsyth's method
            // only rechecks triangles touching the cache; the simple scan is
            // good enough at asset-conditioning time.
            best_score = 0.0;
            let mut next_best: Option<usize> = None;
            for (i, tri) in tris.iter_mut().enumerate() {
                if tri.added {
                    continue;
                }
                tri.score = verts[tri.verts[0] as usize].score
                    + verts[tri.verts[1] as usize].score
                    + verts[tri.verts[2] as usize].score;
                if next_best.is_none() || tri.score > best_score {
                    best_score = tri.score;
                    next_best = Some(i);
                }
            }
            match next_best {
                Some(i) => best_triangle = i,
                None => break,
            }
        }

        let mut index = 0usize;
        for &i in &draw_list {
            self.faces[index] = tris[i].verts[0];
            self.faces[index + 1] = tris[i].verts[1];
            self.faces[index + 2] = tris[i].verts[2];
            index += 3;
        }
    }

    // ── Vertex-order optimization ────────────────────────────────────────

    /// Renumber vertices in first-use order of the optimized index stream,
    /// recording the new->old permutation in `optimize_vert_reorder`, and
    /// reorder every per-vertex array to match.
    pub fn optimize_vertex_order(&mut self) {
        let mut order: Vec<i64> = vec![-1; self.vertex_count()];
        let mut next = 0u32;
        for face in &mut self.faces {
            if order[*face as usize] == -1 {
                order[*face as usize] = next as i64;
                next += 1;
            }
            *face = order[*face as usize] as u32;
        }

        self.optimize_vert_reorder.clear();
        self.optimize_vert_reorder.resize(next as usize, u32::MAX);
        for (old, &new) in order.iter().enumerate() {
            if new >= 0 && (new as usize) < self.optimize_vert_reorder.len() {
                self.optimize_vert_reorder[new as usize] = old as u32;
            } else if new >= 0 {
                warn!("vertex reorder slot {new} out of bounds for vertex {old}");
            }
        }

        let reorder = self.optimize_vert_reorder.clone();
        rearrange_vertices(self, &reorder);
    }

    // ── Translucency support ─────────────────────────────────────────────

    /// Sort triangles by descending squared distance from the camera to the
    /// triangle centroid.
    pub fn sort_triangles_back_to_front(&mut self, camera: Vec3) {
        let mut tris: Vec<([u32; 3], f32)> = self
            .faces
            .chunks_exact(3)
            .map(|c| {
                let center = (self.vert(c[0]) + self.vert(c[1]) + self.vert(c[2])) / 3.0;
                ([c[0], c[1], c[2]], center.distance_squared(camera))
            })
            .collect();
        tris.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut index = 0usize;
        for (verts, _) in &tris {
            self.faces[index] = verts[0];
            self.faces[index + 1] = verts[1];
            self.faces[index + 2] = verts[2];
            index += 3;
        }
    }

    // ── Instrumentation ──────────────────────────────────────────────────

    /// Average cache-miss ratio of the current index stream over a simulated
    /// 32-entry FIFO. Diagnostic only. Note the simulator re-inserts an
    /// index even when it was a hit; only this telemetry value depends on
    /// that boundary, never the final index order.
    pub fn acmr(&self) -> f32 {
        let mut fifo: Vec<i64> = vec![-1; VERTEX_CACHE_SIZE];
        let mut cache_hits = 0usize;
        let mut total = 0usize;
        let mut index = 0usize;
        for &face in &self.faces {
            if fifo.iter().any(|&j| j == face as i64) {
                cache_hits += 1;
            }
            fifo[index] = face as i64;
            index = (index + 1) % fifo.len();
            total += 1;
        }
        if total == 0 {
            return 0.0;
        }
        debug!("opt: {cache_hits} cache hits out of {total}");
        (total - cache_hits) as f32 / total as f32 * 3.0
    }

    /// Re-export as OBJ text; mostly useful for inspection and tests.
    pub fn save_obj(&self, path: &Path) -> std::io::Result<()> {
        let mut out = String::new();
        for v in self.vertices.chunks_exact(3) {
            out.push_str(&format!("v {} {} {}\n", v[0], v[1], v[2]));
        }
        for t in self.tex_coords.chunks_exact(2) {
            out.push_str(&format!("vt {} {}\n", t[0], t[1]));
        }
        for n in self.normals.chunks_exact(3) {
            out.push_str(&format!("vn {} {} {}\n", n[0], n[1], n[2]));
        }
        let has_t = !self.tex_coords.is_empty();
        let has_n = !self.normals.is_empty();
        for f in self.faces.chunks_exact(3) {
            out.push_str("f");
            for &i in f {
                let i = i + 1;
                if has_t && has_n {
                    out.push_str(&format!(" {i}/{i}/{i}"));
                } else if has_t || has_n {
                    out.push_str(&format!(" {i}/{i}"));
                } else {
                    out.push_str(&format!(" {i}"));
                }
            }
            out.push('\n');
        }
        std::fs::write(path, out)
    }
}

#[derive(Debug, Clone)]
struct VertData {
    cache_pos: i32,
    score: f32,
    not_added_triangles: u32,
}

#[derive(Debug, Clone)]
struct TriData {
    added: bool,
    score: f32,
    verts: [u32; 3],
}

// Based on Tom Forsyth's "Linear-Speed Vertex Cache Optimisation".
fn find_vertex_score(vertex: &VertData) -> f32 {
    if vertex.not_added_triangles == 0 {
        // No tri needs this vertex.
        return -1.0;
    }

    let mut score = 0.0f32;
    let cache_pos = vertex.cache_pos;
    if cache_pos >= 0 {
        if cache_pos < 3 {
            // Used by the last emitted triangle: fixed score, so the answer
            // doesn't depend on which corner of that triangle it was.
            score = LAST_TRI_SCORE;
        } else {
            debug_assert!((cache_pos as usize) < VERTEX_CACHE_SIZE);
            let scaler = 1.0 / (VERTEX_CACHE_SIZE - 3) as f32;
            score = 1.0 - (cache_pos - 3) as f32 * scaler;
            score = score.powf(CACHE_DECAY_POWER);
        }
    }

    // Bonus for verts few remaining triangles need, so lone verts retire
    // early.
    let valence_boost = (vertex.not_added_triangles as f32).powf(-VALENCE_BOOST_POWER);
    score += VALENCE_BOOST_SCALE * valence_boost;
    score
}

/// Apply a new->old vertex permutation to every per-vertex array.
pub fn rearrange_vertices(model: &mut Model, new_order: &[u32]) {
    fn permute(arr: &mut Vec<f32>, new_order: &[u32], comps: usize) {
        if arr.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(new_order.len() * comps);
        for &old in new_order {
            let base = old as usize * comps;
            out.extend_from_slice(&arr[base..base + comps]);
        }
        *arr = out;
    }

    permute(&mut model.vertices, new_order, 3);
    permute(&mut model.normals, new_order, 3);
    permute(&mut model.tangents, new_order, 3);
    permute(&mut model.bitangents, new_order, 3);
    permute(&mut model.tex_coords, new_order, 2);
    permute(&mut model.tex_coords2, new_order, 2);
    permute(&mut model.aux, new_order, 3);
    permute(&mut model.bone_weights, new_order, 4);
    permute(&mut model.bone_ids, new_order, 4);
}

// ── OBJ-subset parsing ───────────────────────────────────────────────────

#[derive(Default)]
struct ObjSoup {
    positions: Vec<f32>,
    normals: Vec<f32>,
    tex_coords: Vec<f32>,
    // One entry per face corner after quads are cut into triangles.
    vert_indices: Vec<u32>,
    tex_indices: Vec<u32>,
    norm_indices: Vec<u32>,
    objects: usize,
}

/// A parsed face corner: `v`, `v/t`, `v//n`, or `v/t/n` (1-based).
fn parse_corner(token: &str) -> Option<(u32, Option<u32>, Option<u32>)> {
    let mut parts = token.split('/');
    let v: u32 = parts.next()?.parse().ok()?;
    let t = parts.next().and_then(|s| s.parse().ok());
    let n = parts.next().and_then(|s| s.parse().ok());
    Some((v, t, n))
}

fn parse_obj_soup(text: &str) -> ObjSoup {
    let mut soup = ObjSoup::default();
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("vn ") {
            let mut it = rest.split_whitespace();
            for _ in 0..3 {
                soup.normals
                    .push(it.next().and_then(|s| s.parse().ok()).unwrap_or(0.0));
            }
        } else if let Some(rest) = line.strip_prefix("vt ") {
            let mut it = rest.split_whitespace();
            for _ in 0..2 {
                soup.tex_coords
                    .push(it.next().and_then(|s| s.parse().ok()).unwrap_or(0.0));
            }
        } else if let Some(rest) = line.strip_prefix("v ") {
            let mut it = rest.split_whitespace();
            for _ in 0..3 {
                soup.positions
                    .push(it.next().and_then(|s| s.parse().ok()).unwrap_or(0.0));
            }
        } else if let Some(rest) = line.strip_prefix("f ") {
            let corners: Vec<(u32, Option<u32>, Option<u32>)> =
                rest.split_whitespace().filter_map(parse_corner).collect();
            let emit = |soup: &mut ObjSoup, c: &(u32, Option<u32>, Option<u32>)| {
                soup.vert_indices.push(c.0);
                soup.tex_indices.push(c.1.unwrap_or(0));
                soup.norm_indices.push(c.2.unwrap_or(0));
            };
            match corners.len() {
                3 => {
                    for c in &corners {
                        emit(&mut soup, c);
                    }
                }
                4 => {
                    // Cut the quad into (0,1,2) and (0,2,3).
                    for &i in &[0usize, 1, 2, 0, 2, 3] {
                        emit(&mut soup, &corners[i]);
                    }
                }
                n => {
                    error!("face record with {n} corners ignored (triangles and quads only)");
                }
            }
        } else if line.starts_with("o ") {
            soup.objects += 1;
        }
    }
    // There is always at least one object in a file.
    if soup.objects == 0 {
        soup.objects = 1;
    }
    soup
}

/// Parse an OBJ subset into a triangle soup where every face corner is its
/// own vertex (`faces[i] == i`); welding recombines them later. OBJ's
/// 1-based indices are decremented; out-of-range indices clamp to 0 with an
/// error logged, which beats NaN data or a crash on corrupt exports.
fn parse_triangle_cut_obj(text: &str) -> Result<Model, MeshError> {
    let mut soup = parse_obj_soup(text);
    if soup.objects != 1 {
        return Err(MeshError::MoreThanOneObject);
    }

    let mut vert_error = false;
    let mut tex_error = false;
    let mut norm_error = false;
    let vert_count = (soup.positions.len() / 3) as u32;
    let tex_count = (soup.tex_coords.len() / 2) as u32;
    let norm_count = (soup.normals.len() / 3) as u32;
    for i in 0..soup.vert_indices.len() {
        for (indices, limit, err) in [
            (&mut soup.vert_indices, vert_count, &mut vert_error),
            (&mut soup.tex_indices, tex_count, &mut tex_error),
            (&mut soup.norm_indices, norm_count, &mut norm_error),
        ] {
            if indices[i] > 0 {
                indices[i] -= 1;
            }
            if indices[i] >= limit && indices[i] != 0 {
                indices[i] = 0;
                *err = true;
            }
        }
    }
    if vert_error {
        error!("face (v) indices are higher than parsed data, file is probably corrupt");
    }
    if tex_error {
        error!("face (vt) indices are higher than parsed data, file is probably corrupt");
    }
    if norm_error {
        error!("face (vn) indices are higher than parsed data, file is probably corrupt");
    }

    let corners = soup.vert_indices.len();
    let mut model = Model {
        vertices: Vec::with_capacity(corners * 3),
        faces: (0..corners as u32).collect(),
        ..Model::default()
    };
    let has_normals = norm_count > 0;
    let has_tex = tex_count > 0;
    if has_normals {
        model.normals.reserve(corners * 3);
    }
    model.tex_coords.resize(corners * 2, 0.0);

    for i in 0..corners {
        let v = soup.vert_indices[i] as usize;
        model
            .vertices
            .extend_from_slice(&soup.positions[v * 3..v * 3 + 3]);
        if has_normals {
            let n = soup.norm_indices[i] as usize;
            model
                .normals
                .extend_from_slice(&soup.normals[n * 3..n * 3 + 3]);
        }
        if has_tex {
            let t = soup.tex_indices[i] as usize;
            model.tex_coords[i * 2] = soup.tex_coords[t * 2];
            model.tex_coords[i * 2 + 1] = soup.tex_coords[t * 2 + 1];
        }
    }
    model.tex_coords2 = model.tex_coords.clone();
    model.face_normals = vec![Vec3::ZERO; corners / 3];
    model.tangents.resize(corners * 3, 0.0);
    model.bitangents.resize(corners * 3, 0.0);

    Ok(model)
}
