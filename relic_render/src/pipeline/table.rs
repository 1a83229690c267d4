//! Fixed-size pipeline variant table.
//!
//! All 32 blend/visibility/depth/alpha-test combinations are built eagerly
//! when the render-target configuration becomes known; the draw path only
//! ever performs a table lookup. Nothing here mutates after `build`.

use crate::device::DeviceContext;
use crate::error::*;
use crate::pipeline::flags::{flags_for_index, variant_index, BlendKind, PolyFlags, VARIANT_COUNT};
use crate::rendering::vertex::{vertex_attribute_descriptions, vertex_binding_description};
use crate::shader::{build_module, ShaderCompiler, ShaderProvider, ShaderStage};
use ash::vk;
use snafu::ResultExt;
use tracing::{debug, info};

/// Push-constant block shared by every variant: the object-to-projection
/// matrix plus the UV normalization multipliers of the four texture slots.
pub const PUSH_CONSTANT_SIZE: u32 = 64 + 32;

/// A render-target configuration in the dynamic-rendering sense: the
/// attachment formats and sample count every pipeline in a table targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetConfig {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
}

pub struct PipelineVariantTable {
    pipelines: [vk::Pipeline; VARIANT_COUNT],
    bindless_pipelines: Option<[vk::Pipeline; VARIANT_COUNT]>,
    layout: vk::PipelineLayout,
    config: TargetConfig,
}

impl PipelineVariantTable {
    /// Builds the full table for one target configuration. Shader or
    /// pipeline construction failure is fatal.
    #[profiling::function]
    pub fn build(
        device: &DeviceContext,
        provider: &dyn ShaderProvider,
        compiler: &dyn ShaderCompiler,
        set_layout: vk::DescriptorSetLayout,
        config: TargetConfig,
        bindless: bool,
    ) -> Result<Self> {
        let set_layouts = [set_layout];
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .size(PUSH_CONSTANT_SIZE);
        let push_ranges = [push_range];

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context(CreateResourceErr { what: "pipeline layout" })?;

        let pipelines =
            Self::build_variants(device, provider, compiler, layout, config, false)?;
        let bindless_pipelines = if bindless {
            Some(Self::build_variants(
                device, provider, compiler, layout, config, true,
            )?)
        } else {
            None
        };

        info!(
            "Built {} scene pipelines ({:?}, {:?} samples)",
            VARIANT_COUNT * if bindless { 2 } else { 1 },
            config.color_format,
            config.samples,
        );

        Ok(PipelineVariantTable {
            pipelines,
            bindless_pipelines,
            layout,
            config,
        })
    }

    fn build_variants(
        device: &DeviceContext,
        provider: &dyn ShaderProvider,
        compiler: &dyn ShaderCompiler,
        layout: vk::PipelineLayout,
        config: TargetConfig,
        bindless: bool,
    ) -> Result<[vk::Pipeline; VARIANT_COUNT]> {
        let vert = build_module(
            device, provider, compiler, "scene", ShaderStage::Vertex, "", bindless,
        )?;
        let frag = build_module(
            device, provider, compiler, "scene", ShaderStage::Fragment, "", bindless,
        )?;
        let frag_masked = build_module(
            device,
            provider,
            compiler,
            "scene",
            ShaderStage::Fragment,
            "#define ALPHA_TEST 1\n",
            bindless,
        )?;

        let mut pipelines = [vk::Pipeline::null(); VARIANT_COUNT];
        let mut result = Ok(());

        for (index, slot) in pipelines.iter_mut().enumerate() {
            let flags = flags_for_index(index);
            let frag_module = if flags.contains(PolyFlags::MASKED) {
                frag_masked
            } else {
                frag
            };

            match Self::build_one(device, layout, config, flags, vert, frag_module) {
                Ok(pipeline) => *slot = pipeline,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        unsafe {
            device.device.destroy_shader_module(vert, None);
            device.device.destroy_shader_module(frag, None);
            device.device.destroy_shader_module(frag_masked, None);
        }

        if let Err(e) = result {
            for pipeline in pipelines {
                if pipeline != vk::Pipeline::null() {
                    unsafe { device.device.destroy_pipeline(pipeline, None) };
                }
            }
            return Err(e);
        }

        Ok(pipelines)
    }

    fn build_one(
        device: &DeviceContext,
        layout: vk::PipelineLayout,
        config: TargetConfig,
        flags: PolyFlags,
        vert: vk::ShaderModule,
        frag: vk::ShaderModule,
    ) -> Result<vk::Pipeline> {
        debug!(?flags, "building scene pipeline variant");

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

        let bindings = [vertex_binding_description()];
        let attributes = vertex_attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(config.samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(flags.contains(PolyFlags::OCCLUDE))
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let attachment = Self::blend_attachment(flags);
        let attachments = [attachment];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [config.color_format];
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(config.depth_format);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering);

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| e)
        .context(PipelineBuildErr)?;

        Ok(pipelines[0])
    }

    fn blend_attachment(flags: PolyFlags) -> vk::PipelineColorBlendAttachmentState {
        let write_mask = if flags.contains(PolyFlags::INVISIBLE) {
            vk::ColorComponentFlags::empty()
        } else {
            vk::ColorComponentFlags::RGBA
        };

        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(write_mask)
            .color_blend_op(vk::BlendOp::ADD)
            .alpha_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO);

        match flags.blend_kind() {
            BlendKind::Opaque => state.blend_enable(false),
            BlendKind::Translucent => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_COLOR),
            BlendKind::Modulated => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::DST_COLOR)
                .dst_color_blend_factor(vk::BlendFactor::SRC_COLOR),
            BlendKind::Highlighted => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
        }
    }

    /// Pure lookup: normalizes the flags and indexes the prebuilt table.
    /// Never creates a pipeline on the draw path.
    #[inline]
    pub fn get(&self, flags: PolyFlags, bindless: bool) -> vk::Pipeline {
        let index = variant_index(flags);
        match (&self.bindless_pipelines, bindless) {
            (Some(table), true) => table[index],
            _ => self.pipelines[index],
        }
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn config(&self) -> TargetConfig {
        self.config
    }

    /// Pipelines are only destroyed wholesale, after a full drain; the table
    /// is never mutated while frames are in flight.
    pub fn destroy(self, device: &DeviceContext) {
        unsafe {
            for pipeline in self.pipelines {
                device.device.destroy_pipeline(pipeline, None);
            }
            if let Some(table) = self.bindless_pipelines {
                for pipeline in table {
                    device.device.destroy_pipeline(pipeline, None);
                }
            }
            device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
