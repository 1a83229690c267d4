//! The façade the engine talks to.
//!
//! [`RenderBackend`] ties the device, frame submitter, caches, pipeline
//! tables, postprocess chain and acceleration-structure builder together
//! behind the handful of calls the scene layer makes per frame.

use crate::cache::{ResourceCache, TextureKey, TextureUpload, TEXTURE_SLOTS};
use crate::device::{DeviceContext, GpuImage};
use crate::error::*;
use crate::frame::FrameSubmitter;
use crate::passes::{LayoutTracker, PostTarget, PostprocessChain, PostprocessPush};
use crate::pipeline::{PipelineVariantTable, PolyFlags, TargetConfig};
use crate::raytrace::AccelStructBuilder;
use crate::rendering::vertex::{fan_to_list, SceneVertex, VertexArena};
use crate::shader::{ShaderCompiler, ShaderProvider};
use crate::RenderSettings;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use static_assertions::const_assert_eq;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Color format shared by the scene target, the postprocess chain and the
/// preferred swapchain surface format.
const SCENE_COLOR_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;
const SCENE_DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Per-draw push constants of the scene pipelines.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ScenePush {
    pub transform: [[f32; 4]; 4],
    pub uv_scale: [[f32; 2]; 4],
}

const_assert_eq!(
    std::mem::size_of::<ScenePush>(),
    crate::pipeline::PUSH_CONSTANT_SIZE as usize
);

pub struct RenderBackend {
    device: Arc<DeviceContext>,
    submitter: FrameSubmitter,
    settings: RenderSettings,

    provider: Box<dyn ShaderProvider>,
    compiler: Box<dyn ShaderCompiler>,

    cache: Option<ResourceCache>,
    pipelines: Option<PipelineVariantTable>,
    post: Option<PostprocessChain>,
    accel: Option<AccelStructBuilder>,
    arena: Option<VertexArena>,

    scene_color: Option<GpuImage>,
    scene_depth: Option<GpuImage>,
    scene_layout: LayoutTracker,
    samples: vk::SampleCountFlags,
    extent: vk::Extent2D,
    in_scene_pass: bool,
}

impl RenderBackend {
    pub fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        provider: Box<dyn ShaderProvider>,
        compiler: Box<dyn ShaderCompiler>,
        settings: RenderSettings,
    ) -> Result<Self> {
        let settings = settings.with_engine_args();
        info!(?settings, "Bringing up render backend");

        let (device, surface) = DeviceContext::new(display, window, settings.raytracing)?;
        let device = Arc::new(device);

        let mut submitter = FrameSubmitter::new(
            device.clone(),
            surface,
            settings.vsync,
            settings.fps_cap,
        )?;

        let cache = ResourceCache::new(&mut submitter)?;
        let post = PostprocessChain::new(
            device.clone(),
            provider.as_ref(),
            compiler.as_ref(),
            SCENE_COLOR_FORMAT,
        )?;
        let accel = if settings.raytracing {
            AccelStructBuilder::new(device.clone())
        } else {
            None
        };
        let arena = VertexArena::new(&device, settings.vertex_arena_capacity)?;

        let samples = vk::SampleCountFlags::from_raw(settings.msaa_samples);

        Ok(RenderBackend {
            device,
            submitter,
            settings,
            provider,
            compiler,
            cache: Some(cache),
            pipelines: None,
            post: Some(post),
            accel,
            arena: Some(arena),
            scene_color: None,
            scene_depth: None,
            scene_layout: LayoutTracker::default(),
            samples,
            extent: vk::Extent2D::default(),
            in_scene_pass: false,
        })
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn raytracing_active(&self) -> bool {
        self.accel.is_some()
    }

    /// Prepares the frame: (re)creates size-dependent targets, builds the
    /// pipeline table on first use and rewinds the vertex arena.
    #[profiling::function]
    pub fn begin_frame(&mut self, width: u32, height: u32) -> Result<()> {
        self.ensure_scene_targets(width, height)?;
        self.post
            .as_mut()
            .expect("postprocess chain lives until drop")
            .ensure_targets(&mut self.submitter, width, height)?;

        if self.pipelines.is_none() {
            let cache = self.cache.as_ref().expect("cache lives until drop");
            let config = TargetConfig {
                color_format: SCENE_COLOR_FORMAT,
                depth_format: SCENE_DEPTH_FORMAT,
                samples: self.samples,
            };
            self.pipelines = Some(PipelineVariantTable::build(
                &self.device,
                self.provider.as_ref(),
                self.compiler.as_ref(),
                cache.set_layout(),
                config,
                self.settings.bindless,
            )?);
        }

        self.arena
            .as_mut()
            .expect("arena lives until drop")
            .reset();
        Ok(())
    }

    fn ensure_scene_targets(&mut self, width: u32, height: u32) -> Result<()> {
        if self.extent.width == width
            && self.extent.height == height
            && self.scene_color.is_some()
        {
            return Ok(());
        }

        debug!("Recreating scene targets at {width}x{height}");
        if let Some(old) = self.scene_color.take() {
            self.submitter.delete_list_mut().push_image(old);
        }
        if let Some(old) = self.scene_depth.take() {
            self.submitter.delete_list_mut().push_image(old);
        }

        let color_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(SCENE_COLOR_FORMAT)
            .extent(vk::Extent3D { width, height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(self.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .initial_layout(vk::ImageLayout::UNDEFINED);
        self.scene_color = Some(self.device.allocate_image(
            "scene color",
            &color_info,
            vk::ImageAspectFlags::COLOR,
        )?);

        let depth_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(SCENE_DEPTH_FORMAT)
            .extent(vk::Extent3D { width, height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(self.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        self.scene_depth = Some(self.device.allocate_image(
            "scene depth",
            &depth_info,
            vk::ImageAspectFlags::DEPTH,
        )?);

        self.scene_layout.reset();
        self.extent = vk::Extent2D { width, height };
        Ok(())
    }

    /// Opens the scene pass: layout transitions, dynamic rendering begin,
    /// viewport/scissor, shared vertex buffer.
    #[profiling::function]
    pub fn begin_scene_pass(&mut self, clear_color: [f32; 4]) -> Result<()> {
        if self.in_scene_pass {
            relic_utils::debug_panic!("begin_scene_pass while a scene pass is open");
            return Ok(());
        }

        let cmd = self.submitter.draw_commands()?;
        let scene_color = self.scene_color.as_ref().expect("targets ensured in begin_frame");
        let scene_depth = self.scene_depth.as_ref().expect("targets ensured in begin_frame");

        if let Some(old) = self
            .scene_layout
            .require(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        {
            let barrier = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .dst_access_mask(
                    vk::AccessFlags2::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                )
                .old_layout(old)
                .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .image(scene_color.image)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            let depth_barrier = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .dst_stage_mask(vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS)
                .dst_access_mask(
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .image(scene_depth.image)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::DEPTH)
                        .level_count(1)
                        .layer_count(1),
                );
            let barriers = [barrier, depth_barrier];
            unsafe {
                self.device.device.cmd_pipeline_barrier2(
                    cmd,
                    &vk::DependencyInfo::default().image_memory_barriers(&barriers),
                );
            }
        }

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(scene_color.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            });
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(scene_depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });

        let color_attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent: self.extent })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        let arena = self.arena.as_ref().expect("arena lives until drop");
        unsafe {
            self.device.device.cmd_begin_rendering(cmd, &rendering_info);
            self.device.device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    width: self.extent.width as f32,
                    height: self.extent.height as f32,
                    max_depth: 1.0,
                    ..Default::default()
                }],
            );
            self.device.device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D { offset: vk::Offset2D::default(), extent: self.extent }],
            );
            self.device
                .device
                .cmd_bind_vertex_buffers(cmd, 0, &[arena.buffer()], &[0]);
        }

        self.in_scene_pass = true;
        Ok(())
    }

    pub fn end_scene_pass(&mut self) -> Result<()> {
        if !self.in_scene_pass {
            relic_utils::debug_panic!("end_scene_pass without an open scene pass");
            return Ok(());
        }
        let cmd = self.submitter.draw_commands()?;
        unsafe { self.device.device.cmd_end_rendering(cmd) };
        self.in_scene_pass = false;
        Ok(())
    }

    /// Draws a triangle fan; the expansion to a list happens CPU-side at
    /// arena-append time.
    pub fn draw_triangle_fan(
        &mut self,
        fan: &[SceneVertex],
        textures: [Option<TextureKey>; TEXTURE_SLOTS],
        flags: PolyFlags,
        transform: glam::Mat4,
    ) -> Result<()> {
        let list = fan_to_list(fan);
        self.draw_triangle_list(&list, textures, flags, transform)
    }

    /// Draws a triangle list through the shared arena with the pipeline and
    /// descriptor set derived from `flags` and `textures`.
    #[profiling::function]
    pub fn draw_triangle_list(
        &mut self,
        vertices: &[SceneVertex],
        textures: [Option<TextureKey>; TEXTURE_SLOTS],
        flags: PolyFlags,
        transform: glam::Mat4,
    ) -> Result<()> {
        if vertices.is_empty() {
            return Ok(());
        }
        if !self.in_scene_pass {
            relic_utils::debug_panic!("draw call outside the scene pass");
            return Ok(());
        }

        let flags = flags.normalize();

        let cache = self.cache.as_mut().expect("cache lives until drop");
        let set = cache.descriptor_for_draw(&mut self.submitter, textures, flags)?;
        let uv_scale = textures.map(|slot| {
            slot.map(|key| cache.uv_scale(key)).unwrap_or([1.0, 1.0])
        });

        let first = self
            .arena
            .as_mut()
            .expect("arena lives until drop")
            .append(vertices)?;

        let table = self.pipelines.as_ref().expect("table built in begin_frame");
        let pipeline = table.get(flags, self.settings.bindless);
        let layout = table.layout();

        let push = ScenePush {
            transform: transform.to_cols_array_2d(),
            uv_scale,
        };

        let cmd = self.submitter.draw_commands()?;
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            );
            self.device.device.cmd_push_constants(
                cmd,
                layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&push),
            );
            self.device
                .device
                .cmd_draw(cmd, vertices.len() as u32, 1, first, 0);
        }
        Ok(())
    }

    /// Clears the depth attachment mid-pass (weapon/viewmodel overlay).
    pub fn clear_depth(&mut self) -> Result<()> {
        if !self.in_scene_pass {
            relic_utils::debug_panic!("clear_depth outside the scene pass");
            return Ok(());
        }

        let cmd = self.submitter.draw_commands()?;
        let attachment = vk::ClearAttachment::default()
            .aspect_mask(vk::ImageAspectFlags::DEPTH)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });
        let rect = vk::ClearRect::default()
            .rect(vk::Rect2D { offset: vk::Offset2D::default(), extent: self.extent })
            .layer_count(1);
        unsafe {
            self.device
                .device
                .cmd_clear_attachments(cmd, &[attachment], &[rect]);
        }
        Ok(())
    }

    /// Synchronizes a texture with the cache outside the draw path so its
    /// upload cost lands on a load frame rather than the first visible frame.
    pub fn precache_texture(
        &mut self,
        upload: &TextureUpload,
        flags: PolyFlags,
    ) -> Result<TextureKey> {
        let cache = self.cache.as_mut().expect("cache lives until drop");
        let key = cache.sync_texture(&mut self.submitter, upload)?;
        // Warm the single-texture descriptor set most draws of this texture
        // will use.
        let mut textures = [None; TEXTURE_SLOTS];
        textures[0] = Some(key);
        cache.descriptor_for_draw(&mut self.submitter, textures, flags.normalize())?;
        Ok(key)
    }

    pub fn sync_texture(&mut self, upload: &TextureUpload) -> Result<TextureKey> {
        self.cache
            .as_mut()
            .expect("cache lives until drop")
            .sync_texture(&mut self.submitter, upload)
    }

    /// Replaces the ray-query world geometry. No-op when ray queries are off.
    pub fn set_lighting_mesh(
        &mut self,
        positions: &[[f32; 3]],
        indices: &[u32],
    ) -> Result<()> {
        if let Some(accel) = self.accel.as_mut() {
            accel.set_mesh(&mut self.submitter, positions, indices)?;
        }
        Ok(())
    }

    /// Ensures the acceleration structures are live for this frame's shading.
    pub fn build_acceleration(&mut self, transform: glam::Mat4) -> Result<()> {
        if let Some(accel) = self.accel.as_mut() {
            accel.build(&mut self.submitter, transform)?;
        }
        Ok(())
    }

    /// Finishes the frame: postprocess into the swapchain image, submit,
    /// present, pace. A lost acquire degrades to a submitted-not-presented
    /// frame.
    #[profiling::function]
    pub fn end_frame(&mut self, present: bool) -> Result<()> {
        if self.in_scene_pass {
            relic_utils::debug_panic!("end_frame with an open scene pass");
            self.end_scene_pass()?;
        }

        let (width, height) = (self.extent.width, self.extent.height);
        let present = present && self.submitter.has_draw_commands();

        if present {
            if let Some((index, view)) = self.submitter.acquire_image(width, height)? {
                let image = self
                    .submitter
                    .swapchain()
                    .map(|sc| sc.images[index as usize])
                    .unwrap_or_default();

                let scene = self.scene_color.take().expect("targets ensured in begin_frame");
                let post = self.post.as_mut().expect("postprocess chain lives until drop");
                post.blit_scene(
                    &mut self.submitter,
                    &scene,
                    &mut self.scene_layout,
                    self.samples,
                    PostTarget::Swapchain { image, view },
                    PostprocessPush {
                        gamma: self.settings.gamma,
                        dither: self.settings.dither as u32,
                        inv_size: [1.0 / width as f32, 1.0 / height as f32],
                    },
                )?;
                self.scene_color = Some(scene);
            } else {
                warn!("Swapchain image unavailable; frame drawn but not presented");
            }
        }

        self.submitter.submit_commands(present, width, height)
    }

    /// Submits outstanding work without presenting and drops cached GPU
    /// resources. With `allow_precache` the pipeline table survives so a
    /// following precache pass does not rebuild it.
    #[profiling::function]
    pub fn flush(&mut self, allow_precache: bool) -> Result<()> {
        info!(allow_precache, "Flushing render backend");

        if self.in_scene_pass {
            self.end_scene_pass()?;
        }
        if let Some(accel) = self.accel.as_mut() {
            accel.reset(&mut self.submitter);
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.clear(&mut self.submitter);
        }

        if !allow_precache {
            if let Some(table) = self.pipelines.take() {
                // Safe to destroy synchronously only after the queue drains.
                self.submitter.submit_commands(false, self.extent.width, self.extent.height)?;
                self.device.wait_idle();
                table.destroy(&self.device);
                return Ok(());
            }
        }

        self.submitter
            .submit_commands(false, self.extent.width, self.extent.height)
    }

    /// Copies the final gamma-corrected frame into host memory as tightly
    /// packed BGRA8 rows. Ends the frame without presenting.
    #[profiling::function]
    pub fn read_back_framebuffer(&mut self) -> Result<Vec<u8>> {
        if self.in_scene_pass {
            self.end_scene_pass()?;
        }

        let (width, height) = (self.extent.width, self.extent.height);
        let scene = self.scene_color.take().expect("targets ensured in begin_frame");
        let post = self.post.as_mut().expect("postprocess chain lives until drop");

        post.blit_scene(
            &mut self.submitter,
            &scene,
            &mut self.scene_layout,
            self.samples,
            PostTarget::PingPong1,
            PostprocessPush {
                gamma: self.settings.gamma,
                dither: self.settings.dither as u32,
                inv_size: [1.0 / width as f32, 1.0 / height as f32],
            },
        )?;
        self.scene_color = Some(scene);

        let source = post.ping1_for_read(&mut self.submitter)?.image;

        let size = width as vk::DeviceSize * height as vk::DeviceSize * 4;
        let mut readback = self.device.allocate_buffer(
            "framebuffer read-back",
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        let cmd = self.submitter.draw_commands()?;
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D { width, height, depth: 1 });
        unsafe {
            self.device.device.cmd_copy_image_to_buffer(
                cmd,
                source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                readback.buffer,
                &[region],
            );
        }

        // The submit blocks on the frame fence, so the copy is complete when
        // it returns.
        self.submitter.submit_commands(false, width, height)?;

        let pixels = readback
            .mapped_slice_mut()
            .map(|mapping| mapping[..size as usize].to_vec())
            .ok_or(RenderError::ReadBack { source: vk::Result::ERROR_MEMORY_MAP_FAILED })?;
        self.submitter.delete_list_mut().push_buffer(readback);

        Ok(pixels)
    }

    /// Level-transition cache clear: every texture key and descriptor set
    /// handed out so far becomes stale.
    pub fn clear_caches(&mut self) {
        if let Some(accel) = self.accel.as_mut() {
            accel.reset(&mut self.submitter);
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.clear(&mut self.submitter);
        }
    }
}

impl Drop for RenderBackend {
    fn drop(&mut self) {
        self.device.wait_idle();

        if let Some(accel) = self.accel.take() {
            accel.destroy(&mut self.submitter);
        }
        if let Some(post) = self.post.take() {
            post.destroy(&mut self.submitter);
        }
        if let Some(cache) = self.cache.take() {
            cache.destroy(&mut self.submitter);
        }
        if let Some(arena) = self.arena.take() {
            self.submitter.delete_list_mut().push_buffer(arena.into_buffer());
        }
        if let Some(image) = self.scene_color.take() {
            self.submitter.delete_list_mut().push_image(image);
        }
        if let Some(image) = self.scene_depth.take() {
            self.submitter.delete_list_mut().push_image(image);
        }
        if let Some(table) = self.pipelines.take() {
            table.destroy(&self.device);
        }
        // The submitter's own Drop retires the delete list after a final
        // device idle.
    }
}
