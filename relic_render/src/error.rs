//! Error taxonomy of the render backend.
//!
//! Fatal errors (device bring-up, queue submission, shader and pipeline
//! construction, acceleration-structure builds, vertex-arena exhaustion) tear
//! the backend down; there is no retry path anywhere. Swapchain acquisition
//! failures never surface here, they degrade to a dropped presentation
//! inside [`crate::frame::FrameSubmitter`].

use ash::vk;
use snafu::Snafu;

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Err)), visibility(pub(crate)))]
pub enum RenderError {
    #[snafu(display("Unable to load the Vulkan library: {source}"))]
    LoadLibrary { source: ash::LoadingError },

    #[snafu(display("Unable to create Vulkan {what}: {source}"))]
    DeviceInit { what: &'static str, source: vk::Result },

    #[snafu(display("No queue family supports graphics, compute and transfer together"))]
    NoQueueFamily,

    #[snafu(display("Unable to start the GPU sub-allocator: {source}"))]
    AllocatorInit { source: gpu_allocator::AllocationError },

    #[snafu(display("GPU allocation for {what} failed: {source}"))]
    Allocate { what: &'static str, source: gpu_allocator::AllocationError },

    #[snafu(display("Creating {what} failed: {source}"))]
    CreateResource { what: &'static str, source: vk::Result },

    #[snafu(display("Queue submission failed: {source}"))]
    QueueSubmit { source: vk::Result },

    #[snafu(display("Waiting on the frame fence failed: {source}"))]
    FenceWait { source: vk::Result },

    #[snafu(display("Recording command buffer failed: {source}"))]
    CommandRecord { source: vk::Result },

    #[snafu(display("Unable to create swapchain: {source}"))]
    SwapchainCreate { source: vk::Result },

    #[snafu(display("Shader {name:?} is not provided by the shader source provider"))]
    ShaderMissing { name: &'static str },

    #[snafu(display("Shader {name:?} failed to compile: {message}"))]
    ShaderCompile { name: &'static str, message: String },

    #[snafu(display("Graphics pipeline construction failed: {source}"))]
    PipelineBuild { source: vk::Result },

    #[snafu(display("Descriptor set allocation failed: {source}"))]
    DescriptorAlloc { source: vk::Result },

    #[snafu(display("Acceleration structure build failed: {source}"))]
    AccelBuild { source: vk::Result },

    #[snafu(display(
        "Shared vertex arena exhausted: requested {requested} vertices, {free} of {capacity} free"
    ))]
    VertexArenaFull { requested: u32, free: u32, capacity: u32 },

    #[snafu(display("Framebuffer read-back failed: {source}"))]
    ReadBack { source: vk::Result },
}

impl RenderError {
    /// Whether the render loop must be torn down when this error surfaces.
    ///
    /// Everything in this enum is fatal; the method exists so call sites
    /// document the taxonomy instead of assuming it.
    pub fn is_fatal(&self) -> bool {
        true
    }
}
