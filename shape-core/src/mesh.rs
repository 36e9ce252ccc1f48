use std::io::Write;

use anyhow::Result;

/// An indexed triangle mesh with optional per-vertex colours.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriMesh {
    pub verts: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
    /// RGB in `[0, 1]`, either empty or one entry per vertex.
    pub vertex_colors: Vec<[f32; 3]>,
}

impl TriMesh {
    pub fn new(verts: Vec<[f32; 3]>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            verts,
            faces,
            vertex_colors: Vec::new(),
        }
    }

    pub fn with_vertex_colors(mut self, colors: Vec<[f32; 3]>) -> Result<Self> {
        if colors.len() != self.verts.len() {
            anyhow::bail!(
                "expected {} vertex colors, got {}",
                self.verts.len(),
                colors.len()
            );
        }
        self.vertex_colors = colors;
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Writes the mesh as Wavefront OBJ text.
    ///
    /// Colours go on the vertex line (`v x y z r g b`), faces are 1-based.
    pub fn write_obj<W: Write>(&self, mut writer: W) -> Result<()> {
        let colored = !self.vertex_colors.is_empty();
        for (i, [x, y, z]) in self.verts.iter().enumerate() {
            if colored {
                let [r, g, b] = self.vertex_colors[i];
                writeln!(writer, "v {x:.6} {y:.6} {z:.6} {r:.6} {g:.6} {b:.6}")?;
            } else {
                writeln!(writer, "v {x:.6} {y:.6} {z:.6}")?;
            }
        }
        for [a, b, c] in &self.faces {
            writeln!(writer, "f {} {} {}", a + 1, b + 1, c + 1)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_obj_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write_obj(&mut bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> TriMesh {
        TriMesh::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![[0, 1, 2]],
        )
    }

    #[test]
    fn writes_plain_obj() {
        let obj = String::from_utf8(triangle().to_obj_bytes().unwrap()).unwrap();
        let lines: Vec<&str> = obj.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "v 1.000000 0.000000 0.000000");
        assert_eq!(lines[3], "f 1 2 3");
    }

    #[test]
    fn writes_vertex_colors() {
        let mesh = triangle()
            .with_vertex_colors(vec![[1.0, 0.5, 0.0]; 3])
            .unwrap();
        let obj = String::from_utf8(mesh.to_obj_bytes().unwrap()).unwrap();
        assert!(obj.starts_with("v 0.000000 0.000000 0.000000 1.000000 0.500000 0.000000\n"));
    }

    #[test]
    fn rejects_mismatched_colors() {
        assert!(triangle().with_vertex_colors(vec![[0.0; 3]]).is_err());
    }
}
