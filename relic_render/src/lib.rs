//! Vulkan rendering core for retro software-renderer-era scene data.
//!
//! The crate is a backend, not an engine: windowing, scene traversal, math
//! and shader sources live with the caller. The entry point is
//! [`RenderBackend`]; everything else is reachable through it.

pub mod cache;
pub mod device;
pub mod error;
pub mod frame;
pub mod passes;
pub mod pipeline;
pub mod raytrace;
pub mod rendering;
pub mod shader;

pub use cache::{ContentId, ResourceCache, SourceFormat, TextureKey, TextureUpload};
pub use device::{DeviceContext, GpuBuffer, GpuImage};
pub use error::{RenderError, Result};
pub use frame::FrameSubmitter;
pub use pipeline::{PipelineVariantTable, PolyFlags};
pub use raytrace::{AccelStructBuilder, BuildState};
pub use rendering::{RenderBackend, SceneVertex};
pub use shader::{ShaderCompiler, ShaderProvider, ShaderStage};

use relic_utils::EngineArgs;

/// Backend configuration, resolved once at construction. Command-line
/// switches override the caller's values; see [`EngineArgs`].
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub vsync: bool,
    pub fps_cap: Option<u32>,
    /// Sample count of the scene target; 1 disables multisampling.
    pub msaa_samples: u32,
    pub gamma: f32,
    pub dither: bool,
    pub raytracing: bool,
    pub bindless: bool,
    /// Hard vertex cap of the per-frame shared arena.
    pub vertex_arena_capacity: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            vsync: true,
            fps_cap: None,
            msaa_samples: 1,
            gamma: 1.0,
            dither: true,
            raytracing: true,
            bindless: false,
            vertex_arena_capacity: rendering::DEFAULT_ARENA_CAPACITY,
        }
    }
}

impl RenderSettings {
    /// Applies command-line overrides on top of the configured values.
    pub fn with_engine_args(mut self) -> Self {
        let args = EngineArgs::get();
        if args.no_vsync {
            self.vsync = false;
        }
        if args.no_raytracing {
            self.raytracing = false;
        }
        if args.bindless {
            self.bindless = true;
        }
        if let Some(cap) = args.fps_cap {
            self.fps_cap = Some(cap);
        }
        if let Some(gamma) = args.gamma {
            self.gamma = gamma;
        }
        if let Some(samples) = EngineArgs::msaa_override() {
            self.msaa_samples = samples;
        }
        self
    }
}
