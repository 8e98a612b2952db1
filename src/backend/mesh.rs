// Device-local vertex and index buffers for the one mesh we draw

use anyhow::Result;
use ash::vk;
use super::transfer::TransferEngine;
use super::GpuBuffer;
use crate::assets::MeshData;

pub struct GpuMesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
}

pub fn upload_mesh(engine: &TransferEngine, mesh: &MeshData) -> Result<GpuMesh> {
    anyhow::ensure!(!mesh.indices.is_empty(), "cannot upload an empty mesh");

    let vertex_buffer =
        engine.create_device_local_buffer(&mesh.vertices, vk::BufferUsageFlags::VERTEX_BUFFER)?;
    let index_buffer =
        engine.create_device_local_buffer(&mesh.indices, vk::BufferUsageFlags::INDEX_BUFFER)?;

    log::debug!(
        "Uploaded mesh: {} vertex bytes, {} index bytes",
        vertex_buffer.size,
        index_buffer.size
    );

    Ok(GpuMesh {
        vertex_buffer,
        index_buffer,
        index_count: mesh.indices.len() as u32,
    })
}

impl GpuMesh {
    /// Bind both buffers and issue the single indexed draw
    pub fn record_draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.handle], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.handle, 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }
}
