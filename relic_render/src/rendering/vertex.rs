//! Shared vertex arena and the on-wire vertex format.
//!
//! Every draw of a frame appends into one host-visible buffer with a hard
//! capacity. The cap is a tunable, not a correctness requirement, but
//! exceeding it fails the frame loudly instead of silently dropping
//! primitives.

use crate::device::{DeviceContext, GpuBuffer};
use crate::error::*;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use static_assertions::const_assert_eq;

/// Default arena capacity in vertices.
pub const DEFAULT_ARENA_CAPACITY: u32 = 1 << 20;

/// Flat vertex as produced by the scene layer: position, color, up to four
/// texture-coordinate pairs (base, lightmap, macro, detail) and the per-draw
/// flags word replicated per vertex for flat interpolation.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub uv: [[f32; 2]; 4],
    pub flags: u32,
}

const_assert_eq!(std::mem::size_of::<SceneVertex>(), 64);

pub const VERTEX_STRIDE: u32 = std::mem::size_of::<SceneVertex>() as u32;

pub fn vertex_binding_description() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(VERTEX_STRIDE)
        .input_rate(vk::VertexInputRate::VERTEX)
}

pub fn vertex_attribute_descriptions() -> [vk::VertexInputAttributeDescription; 7] {
    let attr = |location: u32, format: vk::Format, offset: u32| {
        vk::VertexInputAttributeDescription::default()
            .binding(0)
            .location(location)
            .format(format)
            .offset(offset)
    };

    [
        attr(0, vk::Format::R32G32B32_SFLOAT, 0),
        attr(1, vk::Format::R32G32B32A32_SFLOAT, 12),
        attr(2, vk::Format::R32G32_SFLOAT, 28),
        attr(3, vk::Format::R32G32_SFLOAT, 36),
        attr(4, vk::Format::R32G32_SFLOAT, 44),
        attr(5, vk::Format::R32G32_SFLOAT, 52),
        attr(6, vk::Format::R32_UINT, 60),
    ]
}

/// Bookkeeping half of the arena, separated from the GPU buffer so capacity
/// behavior is checkable on its own.
#[derive(Debug)]
pub struct ArenaCursor {
    used: u32,
    capacity: u32,
}

impl ArenaCursor {
    pub fn new(capacity: u32) -> Self {
        ArenaCursor { used: 0, capacity }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Reserves `count` vertices and returns the first vertex index.
    ///
    /// Exhaustion is fatal for the frame; the arena never grows (documented
    /// hard cap).
    pub fn reserve(&mut self, count: u32) -> Result<u32> {
        let free = self.capacity - self.used;
        if count > free {
            return Err(RenderError::VertexArenaFull {
                requested: count,
                free,
                capacity: self.capacity,
            });
        }
        let first = self.used;
        self.used += count;
        Ok(first)
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }
}

/// One large host-visible vertex buffer shared by all draws of a frame.
pub struct VertexArena {
    buffer: GpuBuffer,
    cursor: ArenaCursor,
}

impl VertexArena {
    pub fn new(device: &DeviceContext, capacity: u32) -> Result<Self> {
        let size = capacity as vk::DeviceSize * VERTEX_STRIDE as vk::DeviceSize;
        let buffer = device.allocate_buffer(
            "shared vertex arena",
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;

        Ok(VertexArena {
            buffer,
            cursor: ArenaCursor::new(capacity),
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    pub fn used(&self) -> u32 {
        self.cursor.used()
    }

    /// Copies `vertices` into the arena and returns the first vertex index.
    pub fn append(&mut self, vertices: &[SceneVertex]) -> Result<u32> {
        let first = self.cursor.reserve(vertices.len() as u32)?;

        let bytes: &[u8] = bytemuck::cast_slice(vertices);
        let offset = first as usize * VERTEX_STRIDE as usize;
        let mapping = self
            .buffer
            .mapped_slice_mut()
            .expect("vertex arena is host visible");
        mapping[offset..offset + bytes.len()].copy_from_slice(bytes);

        Ok(first)
    }

    /// Rewinds the arena at the start of a frame. Safe because the previous
    /// frame's fence wait proved the GPU is done reading it.
    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    pub fn into_buffer(self) -> GpuBuffer {
        self.buffer
    }
}

/// Expands a triangle fan into the triangle list the draw path consumes.
/// Vulkan does not guarantee fan topology support, so the expansion happens
/// on the CPU at vertex-arena append time.
pub fn fan_to_list(fan: &[SceneVertex]) -> Vec<SceneVertex> {
    if fan.len() < 3 {
        return Vec::new();
    }

    let mut list = Vec::with_capacity((fan.len() - 2) * 3);
    for i in 1..fan.len() - 1 {
        list.push(fan[0]);
        list.push(fan[i]);
        list.push(fan[i + 1]);
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32) -> SceneVertex {
        SceneVertex {
            position: [x, 0.0, 0.0],
            color: [1.0; 4],
            uv: [[0.0; 2]; 4],
            flags: 0,
        }
    }

    #[test]
    fn reserve_hands_out_sequential_ranges() {
        let mut cursor = ArenaCursor::new(100);
        assert_eq!(cursor.reserve(10).unwrap(), 0);
        assert_eq!(cursor.reserve(5).unwrap(), 10);
        assert_eq!(cursor.used(), 15);
    }

    #[test]
    fn exhaustion_is_a_hard_error() {
        let mut cursor = ArenaCursor::new(32);
        cursor.reserve(32).unwrap();

        let err = cursor.reserve(1).unwrap_err();
        match err {
            RenderError::VertexArenaFull { requested, free, capacity } => {
                assert_eq!(requested, 1);
                assert_eq!(free, 0);
                assert_eq!(capacity, 32);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn over_reserving_in_one_call_fails_without_corruption() {
        let mut cursor = ArenaCursor::new(32);
        assert!(cursor.reserve(33).is_err());
        // A failed reserve must not consume capacity.
        assert_eq!(cursor.used(), 0);
        assert!(cursor.reserve(32).is_ok());
    }

    #[test]
    fn reset_rewinds_to_zero() {
        let mut cursor = ArenaCursor::new(8);
        cursor.reserve(8).unwrap();
        cursor.reset();
        assert_eq!(cursor.used(), 0);
        assert!(cursor.reserve(8).is_ok());
    }

    #[test]
    fn fan_expansion_pivots_on_the_first_vertex() {
        let fan: Vec<_> = (0..5).map(|i| vertex(i as f32)).collect();
        let list = fan_to_list(&fan);

        assert_eq!(list.len(), 9);
        for tri in list.chunks(3) {
            assert_eq!(tri[0], fan[0]);
        }
        assert_eq!(list[1], fan[1]);
        assert_eq!(list[2], fan[2]);
        assert_eq!(list[7], fan[3]);
        assert_eq!(list[8], fan[4]);
    }

    #[test]
    fn degenerate_fans_expand_to_nothing() {
        assert!(fan_to_list(&[vertex(0.0), vertex(1.0)]).is_empty());
    }
}
