// Host-side assets: the OBJ mesh and the RGBA8 texture
//
// Everything here is CPU only. The backend uploads the results.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

/// Interleaved vertex as the vertex shader sees it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        let attribute = |location, format, offset: usize| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(location)
                .format(format)
                .offset(offset as u32)
                .build()
        };

        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, pos)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, color)),
            attribute(2, vk::Format::R32G32_SFLOAT, std::mem::offset_of!(Vertex, tex_coord)),
        ]
    }

    // f32 has no Eq/Hash; dedup on the exact bit patterns
    fn key(&self) -> [u32; 8] {
        let [x, y, z] = self.pos;
        let [r, g, b] = self.color;
        let [u, v] = self.tex_coord;
        [x, y, z, r, g, b, u, v].map(f32::to_bits)
    }
}

/// De-duplicated triangle list
#[derive(Debug, Default, Clone)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

pub fn load_mesh<P: AsRef<Path>>(path: P) -> Result<MeshData> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open model {}", path.display()))?;

    let mesh = parse_obj(&mut std::io::BufReader::new(file))
        .with_context(|| format!("Failed to parse model {}", path.display()))?;

    log::info!(
        "Loaded {}: {} vertices, {} indices",
        path.display(),
        mesh.vertices.len(),
        mesh.indices.len()
    );
    Ok(mesh)
}

/// Parse OBJ text. Materials are ignored; every vertex is white.
pub fn parse_obj<R: BufRead>(reader: &mut R) -> Result<MeshData> {
    let (models, _) = tobj::load_obj_buf(
        reader,
        &tobj::LoadOptions {
            single_index: true,
            triangulate: true,
            ..Default::default()
        },
        |_| Ok(Default::default()),
    )?;

    let mut mesh = MeshData::default();
    let mut unique: HashMap<[u32; 8], u32> = HashMap::new();

    for model in &models {
        let positions = &model.mesh.positions;
        let texcoords = &model.mesh.texcoords;

        for &index in &model.mesh.indices {
            let i = index as usize;
            let pos = positions
                .get(3 * i..3 * i + 3)
                .context("OBJ index out of range")?;
            // Vulkan samples with V pointing down
            let tex_coord = match texcoords.get(2 * i..2 * i + 2) {
                Some(uv) => [uv[0], 1.0 - uv[1]],
                None => [0.0, 0.0],
            };

            let vertex = Vertex {
                pos: [pos[0], pos[1], pos[2]],
                color: [1.0, 1.0, 1.0],
                tex_coord,
            };

            let next = mesh.vertices.len() as u32;
            let index = *unique.entry(vertex.key()).or_insert_with(|| {
                mesh.vertices.push(vertex);
                next
            });
            mesh.indices.push(index);
        }
    }

    anyhow::ensure!(!mesh.indices.is_empty(), "model contains no triangles");
    Ok(mesh)
}

/// Decoded texture, always 4 bytes per texel
#[derive(Debug, Clone)]
pub struct HostImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl HostImage {
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        anyhow::ensure!(width > 0 && height > 0, "texture has zero size ({}x{})", width, height);

        let image = Self { width, height, pixels };
        anyhow::ensure!(
            image.pixels.len() as u64 == image.byte_size(),
            "{}x{} RGBA texture needs {} bytes, got {}",
            width,
            height,
            image.byte_size(),
            image.pixels.len()
        );
        Ok(image)
    }

    /// Staging size: width * height * 4
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * 4
    }
}

/// Decode any supported file and force it to RGBA8
pub fn load_texture<P: AsRef<Path>>(path: P) -> Result<HostImage> {
    let path = path.as_ref();
    let rgba = image::open(path)
        .with_context(|| format!("Failed to load texture {}", path.display()))?
        .to_rgba8();
    let (width, height) = rgba.dimensions();

    log::info!("Loaded texture {} ({}x{})", path.display(), width, height);
    HostImage::from_rgba8(width, height, rgba.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "\
v -1.0 -1.0 0.0
v  1.0 -1.0 0.0
v  1.0  1.0 0.0
v -1.0  1.0 0.0
vt 0.0 0.0
vt 1.0 0.0
vt 1.0 1.0
vt 0.0 1.0
f 1/1 2/2 3/3 4/4
";

    #[test]
    fn quad_shares_corner_vertices() {
        let mesh = parse_obj(&mut QUAD.as_bytes()).unwrap();

        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.vertices.len(), 4);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
    }

    #[test]
    fn texture_v_is_flipped_and_color_is_white() {
        let mesh = parse_obj(&mut QUAD.as_bytes()).unwrap();

        let first = mesh.vertices[mesh.indices[0] as usize];
        assert_eq!(first.pos, [-1.0, -1.0, 0.0]);
        assert_eq!(first.tex_coord, [0.0, 1.0]);
        assert!(mesh.vertices.iter().all(|v| v.color == [1.0, 1.0, 1.0]));
    }

    #[test]
    fn repeated_faces_do_not_grow_vertex_list() {
        let doubled = format!("{}f 1/1 2/2 3/3 4/4\n", QUAD);
        let mesh = parse_obj(&mut doubled.as_bytes()).unwrap();

        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 12);
        assert_eq!(mesh.indices[..6], mesh.indices[6..]);
    }

    #[test]
    fn missing_texcoords_default_to_origin() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n";
        let mesh = parse_obj(&mut obj.as_bytes()).unwrap();

        assert_eq!(mesh.vertices.len(), 3);
        assert!(mesh.vertices.iter().all(|v| v.tex_coord == [0.0, 0.0]));
    }

    #[test]
    fn empty_model_is_rejected() {
        assert!(parse_obj(&mut "v 0 0 0\n".as_bytes()).is_err());
    }

    #[test]
    fn vertex_layout_matches_shader_inputs() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(Vertex::binding_description().stride, 32);

        let offsets: Vec<u32> = Vertex::attribute_descriptions().iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
    }

    #[test]
    fn host_image_size_is_four_bytes_per_texel() {
        let image = HostImage::from_rgba8(3, 5, vec![0; 60]).unwrap();
        assert_eq!(image.byte_size(), 60);

        assert!(HostImage::from_rgba8(3, 5, vec![0; 45]).is_err());
        assert!(HostImage::from_rgba8(0, 5, vec![]).is_err());
    }
}
