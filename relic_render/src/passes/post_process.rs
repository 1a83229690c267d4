//! Post-scene processing: MSAA resolve, gamma/dither, presentation handoff.
//!
//! The chain owns two ping-pong color images at output resolution. Image
//! layouts are tracked explicitly per image; a barrier is only recorded when
//! the tracked layout differs from the required one, so repeated passes over
//! an already-correct image cost nothing.

use crate::device::{DeviceContext, GpuImage};
use crate::error::*;
use crate::frame::FrameSubmitter;
use crate::shader::{build_module, ShaderCompiler, ShaderProvider, ShaderStage};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use snafu::ResultExt;
use std::sync::Arc;
use tracing::debug;

/// Explicitly tracked layout of one image across passes.
#[derive(Debug)]
pub struct LayoutTracker {
    layout: vk::ImageLayout,
}

impl Default for LayoutTracker {
    fn default() -> Self {
        LayoutTracker {
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl LayoutTracker {
    pub fn current(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Demands `layout`; returns the previous layout when a transition barrier
    /// must be recorded, `None` when the image is already there.
    pub fn require(&mut self, layout: vk::ImageLayout) -> Option<vk::ImageLayout> {
        if self.layout == layout {
            return None;
        }
        let old = self.layout;
        self.layout = layout;
        Some(old)
    }

    /// Forgets the contents; the next transition starts from UNDEFINED.
    pub fn reset(&mut self) {
        self.layout = vk::ImageLayout::UNDEFINED;
    }
}

/// Stage/access scope of a layout in this chain's usage of it.
fn sync_scope(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::empty())
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        // PRESENT_SRC and anything unexpected: full barrier.
        _ => (vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ),
    }
}

fn layout_barrier(
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_stage, src_access) = sync_scope(old);
    let (dst_stage, dst_access) = sync_scope(new);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old)
        .new_layout(new)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        )
}

/// Push-constant block of the gamma/dither pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PostprocessPush {
    pub gamma: f32,
    pub dither: u32,
    pub inv_size: [f32; 2],
}

/// Where the gamma pass writes: the swapchain image when presenting, the
/// second ping-pong image for read-back.
pub enum PostTarget {
    Swapchain { image: vk::Image, view: vk::ImageView },
    PingPong1,
}

pub struct PostprocessChain {
    device: Arc<DeviceContext>,
    format: vk::Format,

    ping: [Option<GpuImage>; 2],
    ping_layouts: [LayoutTracker; 2],
    extent: vk::Extent2D,

    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    sampler: vk::Sampler,
    pool: vk::DescriptorPool,
    ping0_set: vk::DescriptorSet,
}

impl PostprocessChain {
    /// Builds the fullscreen gamma/dither pipeline against `format`, which
    /// must match both the swapchain and the ping-pong images.
    pub fn new(
        device: Arc<DeviceContext>,
        provider: &dyn ShaderProvider,
        compiler: &dyn ShaderCompiler,
        format: vk::Format,
    ) -> Result<Self> {
        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT);
        let bindings = [binding];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = unsafe {
            device.device.create_descriptor_set_layout(&layout_info, None)
        }
        .context(CreateResourceErr { what: "post set layout" })?;

        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .size(std::mem::size_of::<PostprocessPush>() as u32);
        let push_ranges = [push_range];
        let set_layouts = [set_layout];
        let pl_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let pipeline_layout = unsafe { device.device.create_pipeline_layout(&pl_info, None) }
            .context(CreateResourceErr { what: "post pipeline layout" })?;

        let pipeline =
            Self::build_pipeline(&device, provider, compiler, pipeline_layout, format)?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE);
        let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context(CreateResourceErr { what: "post sampler" })?;

        Ok(PostprocessChain {
            device,
            format,
            ping: [None, None],
            ping_layouts: [LayoutTracker::default(), LayoutTracker::default()],
            extent: vk::Extent2D::default(),
            set_layout,
            pipeline_layout,
            pipeline,
            sampler,
            pool: vk::DescriptorPool::null(),
            ping0_set: vk::DescriptorSet::null(),
        })
    }

    fn build_pipeline(
        device: &DeviceContext,
        provider: &dyn ShaderProvider,
        compiler: &dyn ShaderCompiler,
        layout: vk::PipelineLayout,
        format: vk::Format,
    ) -> Result<vk::Pipeline> {
        let vert = build_module(
            device, provider, compiler, "post_gamma", ShaderStage::Vertex, "", false,
        )?;
        let frag = build_module(
            device, provider, compiler, "post_gamma", ShaderStage::Fragment, "", false,
        )?;

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag)
                .name(c"main"),
        ];

        // Fullscreen triangle: no vertex buffer, gl_VertexIndex drives it.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let attachments = [attachment];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [format];
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering);

        let result = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| e);

        unsafe {
            device.device.destroy_shader_module(vert, None);
            device.device.destroy_shader_module(frag, None);
        }

        Ok(result.context(PipelineBuildErr)?[0])
    }

    /// (Re)creates the ping-pong images at the output size. Old images and
    /// the descriptor pool are deferred through the delete list.
    pub fn ensure_targets(
        &mut self,
        submitter: &mut FrameSubmitter,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if self.extent.width == width && self.extent.height == height && self.ping[0].is_some() {
            return Ok(());
        }

        debug!("Recreating postprocess targets at {width}x{height}");

        for slot in &mut self.ping {
            if let Some(old) = slot.take() {
                submitter.delete_list_mut().push_image(old);
            }
        }
        if self.pool != vk::DescriptorPool::null() {
            submitter.delete_list_mut().push_descriptor_pool(self.pool);
            self.pool = vk::DescriptorPool::null();
        }

        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(vk::Extent3D { width, height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            )
            .initial_layout(vk::ImageLayout::UNDEFINED);

        for (index, slot) in self.ping.iter_mut().enumerate() {
            *slot = Some(self.device.allocate_image(
                "postprocess target",
                &info,
                vk::ImageAspectFlags::COLOR,
            )?);
            self.ping_layouts[index].reset();
        }
        self.extent = vk::Extent2D { width, height };

        let sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&sizes);
        self.pool = unsafe { self.device.device.create_descriptor_pool(&pool_info, None) }
            .context(CreateResourceErr { what: "post descriptor pool" })?;

        let layouts = [self.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        self.ping0_set = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .context(DescriptorAllocErr)?[0];

        let ping0_view = self.ping[0].as_ref().map(|img| img.view).unwrap_or_default();
        let image_info = [vk::DescriptorImageInfo::default()
            .sampler(self.sampler)
            .image_view(ping0_view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.ping0_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };

        Ok(())
    }

    pub fn ping1(&self) -> Option<&GpuImage> {
        self.ping[1].as_ref()
    }

    /// Carries the scene color to the target: resolve or copy into ping-pong
    /// 0, gamma/dither fullscreen pass into the target, and for a swapchain
    /// target the terminal transition to PRESENT_SRC.
    #[profiling::function]
    pub fn blit_scene(
        &mut self,
        submitter: &mut FrameSubmitter,
        scene: &GpuImage,
        scene_layout: &mut LayoutTracker,
        scene_samples: vk::SampleCountFlags,
        target: PostTarget,
        push: PostprocessPush,
    ) -> Result<()> {
        let cmd = submitter.draw_commands()?;
        let device = self.device.clone();
        let extent = self.extent;

        // Scene color and ping 0 into transfer layouts.
        let mut barriers = Vec::with_capacity(2);
        if let Some(old) = scene_layout.require(vk::ImageLayout::TRANSFER_SRC_OPTIMAL) {
            barriers.push(layout_barrier(scene.image, old, vk::ImageLayout::TRANSFER_SRC_OPTIMAL));
        }
        let ping0 = self.ping[0].as_ref().expect("targets ensured before blit");
        if let Some(old) = self.ping_layouts[0].require(vk::ImageLayout::TRANSFER_DST_OPTIMAL) {
            barriers.push(layout_barrier(ping0.image, old, vk::ImageLayout::TRANSFER_DST_OPTIMAL));
        }
        Self::record_barriers(&device, cmd, &barriers);

        let subresource = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .layer_count(1);

        if scene_samples != vk::SampleCountFlags::TYPE_1 {
            let region = vk::ImageResolve::default()
                .src_subresource(subresource)
                .dst_subresource(subresource)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                });
            unsafe {
                device.device.cmd_resolve_image(
                    cmd,
                    scene.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    ping0.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        } else {
            let region = vk::ImageCopy::default()
                .src_subresource(subresource)
                .dst_subresource(subresource)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                });
            unsafe {
                device.device.cmd_copy_image(
                    cmd,
                    scene.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    ping0.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        }

        // Ping 0 becomes the gamma pass's input.
        let mut barriers = Vec::with_capacity(2);
        if let Some(old) = self.ping_layouts[0].require(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        {
            barriers.push(layout_barrier(
                ping0.image,
                old,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ));
        }

        let (target_image, target_view, target_old) = match &target {
            PostTarget::Swapchain { image, view } => {
                // Swapchain contents from last frame are irrelevant.
                (*image, *view, vk::ImageLayout::UNDEFINED)
            }
            PostTarget::PingPong1 => {
                let ping1 = self.ping[1].as_ref().expect("targets ensured before blit");
                let old = self.ping_layouts[1]
                    .require(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .unwrap_or(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
                (ping1.image, ping1.view, old)
            }
        };
        if target_old != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
            barriers.push(layout_barrier(
                target_image,
                target_old,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ));
        }
        Self::record_barriers(&device, cmd, &barriers);

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE);
        let color_attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent })
            .layer_count(1)
            .color_attachments(&color_attachments);

        unsafe {
            device.device.cmd_begin_rendering(cmd, &rendering_info);
            device.device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    width: extent.width as f32,
                    height: extent.height as f32,
                    max_depth: 1.0,
                    ..Default::default()
                }],
            );
            device.device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D { offset: vk::Offset2D::default(), extent }],
            );
            device.device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline,
            );
            device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[self.ping0_set],
                &[],
            );
            device.device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&push),
            );
            device.device.cmd_draw(cmd, 3, 1, 0, 0);
            device.device.cmd_end_rendering(cmd);
        }

        if let PostTarget::Swapchain { image, .. } = target {
            let barrier = layout_barrier(
                image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
            Self::record_barriers(&device, cmd, &[barrier]);
        }

        Ok(())
    }

    /// Transitions ping-pong 1 for a transfer read, used by the framebuffer
    /// read-back path after [`Self::blit_scene`] targeted it.
    pub(crate) fn ping1_for_read(
        &mut self,
        submitter: &mut FrameSubmitter,
    ) -> Result<&GpuImage> {
        let cmd = submitter.draw_commands()?;
        let ping1 = self.ping[1].as_ref().expect("targets ensured before read-back");
        if let Some(old) = self.ping_layouts[1].require(vk::ImageLayout::TRANSFER_SRC_OPTIMAL) {
            let barrier =
                layout_barrier(ping1.image, old, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            Self::record_barriers(&self.device, cmd, &[barrier]);
        }
        Ok(ping1)
    }

    fn record_barriers(
        device: &DeviceContext,
        cmd: vk::CommandBuffer,
        barriers: &[vk::ImageMemoryBarrier2],
    ) {
        if barriers.is_empty() {
            return;
        }
        unsafe {
            device.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(barriers),
            );
        }
    }

    pub fn destroy(mut self, submitter: &mut FrameSubmitter) {
        for slot in &mut self.ping {
            if let Some(image) = slot.take() {
                submitter.delete_list_mut().push_image(image);
            }
        }
        if self.pool != vk::DescriptorPool::null() {
            submitter.delete_list_mut().push_descriptor_pool(self.pool);
        }

        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.set_layout, None);
            self.device.device.destroy_sampler(self.sampler, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_starts_undefined() {
        let tracker = LayoutTracker::default();
        assert_eq!(tracker.current(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn first_transition_reports_undefined_as_old_layout() {
        let mut tracker = LayoutTracker::default();
        let old = tracker.require(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(old, Some(vk::ImageLayout::UNDEFINED));
    }

    #[test]
    fn repeated_same_layout_needs_no_barrier() {
        let mut tracker = LayoutTracker::default();
        tracker.require(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(tracker.require(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL), None);
        assert_eq!(tracker.require(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL), None);
    }

    #[test]
    fn transitions_chain_through_tracked_state() {
        let mut tracker = LayoutTracker::default();
        tracker.require(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let old = tracker.require(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(old, Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL));
    }

    #[test]
    fn reset_forgets_contents() {
        let mut tracker = LayoutTracker::default();
        tracker.require(vk::ImageLayout::PRESENT_SRC_KHR);
        tracker.reset();
        assert_eq!(
            tracker.require(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            Some(vk::ImageLayout::UNDEFINED),
        );
    }

    #[test]
    fn undefined_source_scope_has_no_access_to_flush() {
        let (_, access) = sync_scope(vk::ImageLayout::UNDEFINED);
        assert_eq!(access, vk::AccessFlags2::empty());
    }
}
