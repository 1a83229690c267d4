//! Acceleration-structure builds for ray-query lighting.
//!
//! The builder is a small state machine; every transition records GPU work on
//! the current frame's command buffers and every teardown defers through the
//! frame delete list, so a rebuild mid-frame never frees memory the in-flight
//! frame still reads. When no mesh has been provided, a two-triangle
//! placeholder keeps the top-level structure valid so shaders can bind it
//! unconditionally.

use crate::device::{DeviceContext, GpuBuffer};
use crate::error::*;
use crate::frame::FrameSubmitter;
use ash::khr;
use ash::vk;
use gpu_allocator::MemoryLocation;
use snafu::ResultExt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Empty,
    VerticesUploaded,
    BottomLevelBuilt,
    TopLevelBuilt,
}

/// Geometry used while no real mesh has been set: two far-apart triangles, so
/// ray queries hit nothing interesting but the TLAS is never null.
pub(crate) fn placeholder_geometry() -> (Vec<[f32; 3]>, Vec<u32>) {
    let vertices = vec![
        [-100_000.0, -100_000.0, -100_000.0],
        [-100_000.0 + 1.0, -100_000.0, -100_000.0],
        [-100_000.0, -100_000.0 + 1.0, -100_000.0],
        [100_000.0, 100_000.0, 100_000.0],
        [100_000.0 - 1.0, 100_000.0, 100_000.0],
        [100_000.0, 100_000.0 - 1.0, 100_000.0],
    ];
    let indices = vec![0, 1, 2, 3, 4, 5];
    (vertices, indices)
}

/// Offset of the index region inside the shared staging buffer; indices need
/// 4-byte alignment after the vertex bytes.
pub(crate) fn index_offset(vertex_bytes: usize) -> usize {
    vertex_bytes.next_multiple_of(4)
}

/// Packs a column-major matrix into the row-major 3x4 layout instance
/// transforms use.
pub(crate) fn pack_transform(matrix: glam::Mat4) -> vk::TransformMatrixKHR {
    let m = matrix.transpose().to_cols_array();
    let mut rows = [0.0f32; 12];
    rows.copy_from_slice(&m[..12]);
    vk::TransformMatrixKHR { matrix: rows }
}

pub struct AccelStructBuilder {
    device: Arc<DeviceContext>,
    loader: khr::acceleration_structure::Device,
    state: BuildState,

    vertex_buffer: Option<GpuBuffer>,
    index_buffer: Option<GpuBuffer>,
    vertex_count: u32,
    index_count: u32,

    blas: Option<(vk::AccelerationStructureKHR, GpuBuffer)>,
    tlas: Option<(vk::AccelerationStructureKHR, GpuBuffer)>,
    instance_buffer: Option<GpuBuffer>,
}

impl AccelStructBuilder {
    /// `None` when the device came up without ray-query support.
    pub fn new(device: Arc<DeviceContext>) -> Option<Self> {
        let loader = device.accel_loader.clone()?;
        Some(AccelStructBuilder {
            device,
            loader,
            state: BuildState::Empty,
            vertex_buffer: None,
            index_buffer: None,
            vertex_count: 0,
            index_count: 0,
            blas: None,
            tlas: None,
            instance_buffer: None,
        })
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn tlas(&self) -> Option<vk::AccelerationStructureKHR> {
        self.tlas.as_ref().map(|(handle, _)| *handle)
    }

    /// Replaces the tracked geometry. One staging copy carries both streams;
    /// they are split into separate device-local buffers on the GPU.
    #[profiling::function]
    pub fn set_mesh(
        &mut self,
        submitter: &mut FrameSubmitter,
        positions: &[[f32; 3]],
        indices: &[u32],
    ) -> Result<()> {
        self.reset(submitter);

        debug!(
            "Uploading acceleration geometry: {} vertices, {} triangles",
            positions.len(),
            indices.len() / 3,
        );

        let vertex_bytes: &[u8] = bytemuck::cast_slice(positions);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        let index_start = index_offset(vertex_bytes.len());

        let mut staging = self.device.allocate_buffer(
            "accel staging",
            (index_start + index_bytes.len()) as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        {
            let mapping = staging
                .mapped_slice_mut()
                .expect("staging memory is host visible");
            mapping[..vertex_bytes.len()].copy_from_slice(vertex_bytes);
            mapping[index_start..index_start + index_bytes.len()].copy_from_slice(index_bytes);
        }

        let build_input_usage = vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

        let vertex_buffer = self.device.allocate_buffer(
            "accel vertices",
            vertex_bytes.len() as vk::DeviceSize,
            build_input_usage,
            MemoryLocation::GpuOnly,
        )?;
        let index_buffer = self.device.allocate_buffer(
            "accel indices",
            index_bytes.len() as vk::DeviceSize,
            build_input_usage,
            MemoryLocation::GpuOnly,
        )?;

        let cmd = submitter.transfer_commands()?;
        unsafe {
            self.device.device.cmd_copy_buffer(
                cmd,
                staging.buffer,
                vertex_buffer.buffer,
                &[vk::BufferCopy::default().size(vertex_bytes.len() as vk::DeviceSize)],
            );
            self.device.device.cmd_copy_buffer(
                cmd,
                staging.buffer,
                index_buffer.buffer,
                &[vk::BufferCopy::default()
                    .src_offset(index_start as vk::DeviceSize)
                    .size(index_bytes.len() as vk::DeviceSize)],
            );

            // Copies must land before the build reads the streams.
            let barrier = vk::MemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::COPY)
                .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
                .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
            let barriers = [barrier];
            self.device.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().memory_barriers(&barriers),
            );
        }
        submitter.delete_list_mut().push_buffer(staging);

        self.vertex_buffer = Some(vertex_buffer);
        self.index_buffer = Some(index_buffer);
        self.vertex_count = positions.len() as u32;
        self.index_count = indices.len() as u32;
        self.state = BuildState::VerticesUploaded;
        Ok(())
    }

    /// Drives the state machine to `TopLevelBuilt`, recording BLAS and TLAS
    /// builds on the frame's draw command buffer. Uses the placeholder
    /// geometry when no mesh has been set.
    #[profiling::function]
    pub fn build(&mut self, submitter: &mut FrameSubmitter, transform: glam::Mat4) -> Result<()> {
        if self.state == BuildState::Empty {
            let (positions, indices) = placeholder_geometry();
            self.set_mesh(submitter, &positions, &indices)?;
        }

        if self.state == BuildState::VerticesUploaded {
            self.build_bottom_level(submitter)?;
        }
        if self.state == BuildState::BottomLevelBuilt {
            self.build_top_level(submitter, transform)?;
        }
        Ok(())
    }

    fn build_bottom_level(&mut self, submitter: &mut FrameSubmitter) -> Result<()> {
        let cmd = submitter.draw_commands()?;

        let vertex_buffer = self.vertex_buffer.as_ref().expect("vertices uploaded");
        let index_buffer = self.index_buffer.as_ref().expect("indices uploaded");
        let triangle_count = self.index_count / 3;

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.device.buffer_device_address(vertex_buffer.buffer),
            })
            .vertex_stride(12)
            .max_vertex(self.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.device.buffer_device_address(index_buffer.buffer),
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE);
        let geometries = [geometry];

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[triangle_count],
                &mut sizes,
            );
        }

        let (handle, backing, scratch) =
            self.create_structure(
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                "bottom-level structure",
                &sizes,
            )?;

        build_info = build_info
            .dst_acceleration_structure(handle)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: self.device.buffer_device_address(scratch.buffer),
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(triangle_count);
        unsafe {
            self.loader
                .cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);

            // The TLAS build reads the BLAS this build writes.
            let barrier = vk::MemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
                .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
                .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
            let barriers = [barrier];
            self.device.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().memory_barriers(&barriers),
            );
        }

        // Scratch memory is only needed during the build on this very frame.
        submitter.delete_list_mut().push_buffer(scratch);

        self.blas = Some((handle, backing));
        self.state = BuildState::BottomLevelBuilt;
        Ok(())
    }

    fn build_top_level(
        &mut self,
        submitter: &mut FrameSubmitter,
        transform: glam::Mat4,
    ) -> Result<()> {
        let cmd = submitter.draw_commands()?;

        let (blas_handle, _) = self.blas.as_ref().expect("bottom level built");
        let blas_address = unsafe {
            self.loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(*blas_handle),
            )
        };

        let instance = vk::AccelerationStructureInstanceKHR {
            transform: pack_transform(transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xff),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
                    .as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas_address,
            },
        };

        let mut instance_buffer = self.device.allocate_buffer(
            "accel instances",
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as vk::DeviceSize,
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            MemoryLocation::CpuToGpu,
        )?;
        unsafe {
            let mapping = instance_buffer
                .mapped_slice_mut()
                .expect("instance memory is host visible");
            std::ptr::copy_nonoverlapping(
                (&instance as *const vk::AccelerationStructureInstanceKHR).cast::<u8>(),
                mapping.as_mut_ptr(),
                std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            );
        }

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.device.buffer_device_address(instance_buffer.buffer),
            });
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            });
        let geometries = [geometry];

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[1],
                &mut sizes,
            );
        }

        let (handle, backing, scratch) = self.create_structure(
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            "top-level structure",
            &sizes,
        )?;

        build_info = build_info
            .dst_acceleration_structure(handle)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: self.device.buffer_device_address(scratch.buffer),
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(1);
        unsafe {
            self.loader
                .cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);

            // Ray queries in fragment shaders read the finished TLAS.
            let barrier = vk::MemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
                .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
                .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
            let barriers = [barrier];
            self.device.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().memory_barriers(&barriers),
            );
        }

        submitter.delete_list_mut().push_buffer(scratch);

        self.instance_buffer = Some(instance_buffer);
        self.tlas = Some((handle, backing));
        self.state = BuildState::TopLevelBuilt;

        info!("Acceleration structures rebuilt ({} triangles)", self.index_count / 3);
        Ok(())
    }

    /// Allocates backing + scratch and creates the structure handle.
    fn create_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        name: &'static str,
        sizes: &vk::AccelerationStructureBuildSizesInfoKHR,
    ) -> Result<(vk::AccelerationStructureKHR, GpuBuffer, GpuBuffer)> {
        let backing = self.device.allocate_buffer(
            name,
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;
        let scratch = self.device.allocate_buffer(
            "accel scratch",
            sizes.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;

        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(backing.buffer)
            .size(sizes.acceleration_structure_size)
            .ty(ty);
        let handle = unsafe { self.loader.create_acceleration_structure(&info, None) }
            .context(AccelBuildErr)?;

        Ok((handle, backing, scratch))
    }

    /// Returns to `Empty`. Everything goes through the delete list; the
    /// in-flight frame may still trace against the old structures.
    pub fn reset(&mut self, submitter: &mut FrameSubmitter) {
        let list = submitter.delete_list_mut();
        if let Some((handle, backing)) = self.tlas.take() {
            list.push_accel_struct(handle);
            list.push_buffer(backing);
        }
        if let Some((handle, backing)) = self.blas.take() {
            list.push_accel_struct(handle);
            list.push_buffer(backing);
        }
        for buffer in [
            self.vertex_buffer.take(),
            self.index_buffer.take(),
            self.instance_buffer.take(),
        ]
        .into_iter()
        .flatten()
        {
            list.push_buffer(buffer);
        }

        self.vertex_count = 0;
        self.index_count = 0;
        self.state = BuildState::Empty;
    }

    pub fn destroy(mut self, submitter: &mut FrameSubmitter) {
        self.reset(submitter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_geometry_is_two_disjoint_triangles() {
        let (vertices, indices) = placeholder_geometry();
        assert_eq!(vertices.len(), 6);
        assert_eq!(indices.len(), 6);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));

        // Non-degenerate: each triangle spans distinct points.
        for tri in indices.chunks(3) {
            let [a, b, c] = [
                vertices[tri[0] as usize],
                vertices[tri[1] as usize],
                vertices[tri[2] as usize],
            ];
            assert_ne!(a, b);
            assert_ne!(b, c);
            assert_ne!(a, c);
        }
    }

    #[test]
    fn index_region_is_four_byte_aligned() {
        assert_eq!(index_offset(0), 0);
        assert_eq!(index_offset(12), 12);
        assert_eq!(index_offset(13), 16);
        assert_eq!(index_offset(15), 16);
    }

    #[test]
    fn transform_packing_is_row_major_with_translation_last() {
        let packed = pack_transform(glam::Mat4::IDENTITY);
        let expected = [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        ];
        assert_eq!(packed.matrix, expected);

        let translated = pack_transform(glam::Mat4::from_translation(glam::vec3(2.0, 3.0, 4.0)));
        assert_eq!(translated.matrix[3], 2.0);
        assert_eq!(translated.matrix[7], 3.0);
        assert_eq!(translated.matrix[11], 4.0);
    }
}
