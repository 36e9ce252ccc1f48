//! Iso-surface extraction over a regular grid.
//!
//! Each grid cell is split into six tetrahedra sharing the cell's main
//! diagonal, so neighbouring cells split their shared faces the same way and
//! the resulting surface has no cracks. Vertices are shared between
//! triangles by keying them on the grid edge they were interpolated from.

use std::collections::HashMap;

use anyhow::Result;

use crate::TriMesh;

const CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

const TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 5, 1, 6],
    [0, 1, 2, 6],
    [0, 2, 3, 6],
    [0, 3, 7, 6],
    [0, 7, 4, 6],
    [0, 4, 5, 6],
];

/// An axis-aligned cube sampled at `resolution` points per axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    resolution: usize,
    min: [f32; 3],
    max: [f32; 3],
}

impl Grid {
    pub fn new(resolution: usize, min: [f32; 3], max: [f32; 3]) -> Result<Self> {
        if resolution < 2 {
            anyhow::bail!("grid resolution must be at least 2, got {resolution}");
        }
        if (0..3).any(|axis| max[axis] <= min[axis]) {
            anyhow::bail!("empty grid bounds {min:?}..{max:?}");
        }
        Ok(Self {
            resolution,
            min,
            max,
        })
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.resolution.pow(3)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(&self, [i, j, k]: [usize; 3]) -> usize {
        (i * self.resolution + j) * self.resolution + k
    }

    pub fn point(&self, ijk: [usize; 3]) -> [f32; 3] {
        let step = (self.resolution - 1) as f32;
        std::array::from_fn(|axis| {
            self.min[axis] + (self.max[axis] - self.min[axis]) * ijk[axis] as f32 / step
        })
    }

    /// All sample points, x-major, matching the layout expected by
    /// [`marching_tetrahedra`].
    pub fn points(&self) -> Vec<[f32; 3]> {
        let n = self.resolution;
        let mut points = Vec::with_capacity(self.len());
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    points.push(self.point([i, j, k]));
                }
            }
        }
        points
    }
}

/// Extracts the surface where `values` crosses `level`.
///
/// Samples below `level` are inside. Triangles are wound so that their
/// normals point from the inside towards the outside.
pub fn marching_tetrahedra(grid: &Grid, values: &[f32], level: f32) -> Result<TriMesh> {
    if values.len() != grid.len() {
        anyhow::bail!(
            "expected {} field samples, got {}",
            grid.len(),
            values.len()
        );
    }

    let mut builder = SurfaceBuilder {
        grid,
        values,
        level,
        verts: Vec::new(),
        faces: Vec::new(),
        edge_vertex: HashMap::new(),
    };

    let cells = grid.resolution - 1;
    for i in 0..cells {
        for j in 0..cells {
            for k in 0..cells {
                let corners = CORNERS.map(|[di, dj, dk]| [i + di, j + dj, k + dk]);
                for tet in TETRAHEDRA {
                    builder.polygonize(tet.map(|c| corners[c]));
                }
            }
        }
    }

    Ok(TriMesh::new(builder.verts, builder.faces))
}

struct SurfaceBuilder<'a> {
    grid: &'a Grid,
    values: &'a [f32],
    level: f32,
    verts: Vec<[f32; 3]>,
    faces: Vec<[u32; 3]>,
    edge_vertex: HashMap<(usize, usize), u32>,
}

impl SurfaceBuilder<'_> {
    fn polygonize(&mut self, tet: [[usize; 3]; 4]) {
        let (inside, outside): (Vec<[usize; 3]>, Vec<[usize; 3]>) = tet
            .into_iter()
            .partition(|&p| self.values[self.grid.index(p)] < self.level);

        let direction = sub(centroid(self.grid, &outside), centroid(self.grid, &inside));
        match (inside.as_slice(), outside.as_slice()) {
            ([a], [b, c, d]) | ([b, c, d], [a]) => {
                let ring = [self.vertex(*a, *b), self.vertex(*a, *c), self.vertex(*a, *d)];
                self.push_face(ring, direction);
            }
            ([a, b], [c, d]) => {
                let ring = [
                    self.vertex(*a, *c),
                    self.vertex(*b, *c),
                    self.vertex(*b, *d),
                    self.vertex(*a, *d),
                ];
                self.push_face([ring[0], ring[1], ring[2]], direction);
                self.push_face([ring[0], ring[2], ring[3]], direction);
            }
            _ => {}
        }
    }

    fn vertex(&mut self, p: [usize; 3], q: [usize; 3]) -> u32 {
        let (ip, iq) = (self.grid.index(p), self.grid.index(q));
        let key = (ip.min(iq), ip.max(iq));
        if let Some(&id) = self.edge_vertex.get(&key) {
            return id;
        }

        let (vp, vq) = (self.values[ip], self.values[iq]);
        let t = ((self.level - vp) / (vq - vp)).clamp(0.0, 1.0);
        let (pp, pq) = (self.grid.point(p), self.grid.point(q));
        let position = std::array::from_fn(|axis| pp[axis] + t * (pq[axis] - pp[axis]));

        let id = self.verts.len() as u32;
        self.verts.push(position);
        self.edge_vertex.insert(key, id);
        id
    }

    fn push_face(&mut self, [a, b, c]: [u32; 3], outward: [f32; 3]) {
        let (pa, pb, pc) = (
            self.verts[a as usize],
            self.verts[b as usize],
            self.verts[c as usize],
        );
        let normal = cross(sub(pb, pa), sub(pc, pa));
        if dot(normal, outward) < 0.0 {
            self.faces.push([a, c, b]);
        } else {
            self.faces.push([a, b, c]);
        }
    }
}

fn centroid(grid: &Grid, points: &[[usize; 3]]) -> [f32; 3] {
    let n = points.len() as f32;
    points.iter().fold([0.0; 3], |acc, &p| {
        let q = grid.point(p);
        [acc[0] + q[0] / n, acc[1] + q[1] / n, acc[2] + q[2] / n]
    })
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere(grid: &Grid, radius: f32) -> Vec<f32> {
        grid.points()
            .into_iter()
            .map(|p| dot(p, p).sqrt() - radius)
            .collect()
    }

    #[test]
    fn sphere_vertices_lie_on_surface() {
        let grid = Grid::new(24, [-1.0; 3], [1.0; 3]).unwrap();
        let mesh = marching_tetrahedra(&grid, &sphere(&grid, 0.6), 0.0).unwrap();

        assert!(mesh.faces.len() > 100);
        let cell = 2.0 / 23.0;
        for v in &mesh.verts {
            assert!((dot(*v, *v).sqrt() - 0.6).abs() < cell);
        }
    }

    #[test]
    fn sphere_is_closed_and_outward_facing() {
        let grid = Grid::new(20, [-1.0; 3], [1.0; 3]).unwrap();
        let mesh = marching_tetrahedra(&grid, &sphere(&grid, 0.5), 0.0).unwrap();

        let mut edges: HashMap<(u32, u32), i32> = HashMap::new();
        let mut volume = 0.0;
        for &[a, b, c] in &mesh.faces {
            for (p, q) in [(a, b), (b, c), (c, a)] {
                *edges.entry((p.min(q), p.max(q))).or_default() += 1;
            }
            let (pa, pb, pc) = (
                mesh.verts[a as usize],
                mesh.verts[b as usize],
                mesh.verts[c as usize],
            );
            volume += dot(pa, cross(pb, pc)) / 6.0;
        }
        assert!(edges.values().all(|&count| count == 2));

        // Outward winding gives a positive enclosed volume close to 4/3 pi r^3.
        let expected = 4.0 / 3.0 * std::f32::consts::PI * 0.125;
        assert!((volume - expected).abs() < 0.15 * expected, "volume {volume}");
    }

    #[test]
    fn empty_field_gives_empty_mesh() {
        let grid = Grid::new(4, [-1.0; 3], [1.0; 3]).unwrap();
        let mesh = marching_tetrahedra(&grid, &vec![1.0; grid.len()], 0.0).unwrap();
        assert!(mesh.is_empty());
    }

    #[test]
    fn rejects_wrong_sample_count() {
        let grid = Grid::new(4, [-1.0; 3], [1.0; 3]).unwrap();
        assert!(marching_tetrahedra(&grid, &[0.0; 8], 0.0).is_err());
        assert!(Grid::new(1, [-1.0; 3], [1.0; 3]).is_err());
    }
}
