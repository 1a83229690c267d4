//! Abstraction over the physical/logical Vulkan device.
//!
//! [`DeviceContext`] is responsible for instance and device bring-up, queue
//! selection and GPU memory sub-allocation. It is the leaf dependency of the
//! whole backend; everything else borrows it.

use crate::error::*;
use ash::khr;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use snafu::ResultExt;
use std::ffi::CStr;
use tracing::{debug, info, warn};

const APP_NAME: &CStr = c"relic";

/// A buffer together with its sub-allocation.
///
/// Destruction is never synchronous; buffers travel through the frame
/// delete list once no in-flight work can reference them.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    /// Host-visible mapping of the whole buffer, if the memory is mappable.
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut()?.mapped_slice_mut()
    }
}

pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

pub struct DeviceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub limits: vk::PhysicalDeviceLimits,

    pub surface_loader: khr::surface::Instance,
    pub swapchain_loader: khr::swapchain::Device,
    pub accel_loader: Option<khr::acceleration_structure::Device>,

    pub command_pool: vk::CommandPool,
    allocator: Mutex<Option<Allocator>>,
}

impl DeviceContext {
    /// Brings up instance, surface-compatible device and sub-allocator.
    ///
    /// The chosen queue family must support graphics, compute and transfer
    /// together; transfer and draw command buffers are submitted to the same
    /// queue by design. Any failure here is fatal.
    pub fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        raytracing: bool,
    ) -> Result<(Self, vk::SurfaceKHR)> {
        let entry = unsafe { ash::Entry::load() }.context(LoadLibraryErr)?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .api_version(vk::API_VERSION_1_3);

        let surface_extensions = ash_window::enumerate_required_extensions(display)
            .context(DeviceInitErr { what: "instance" })?;

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(surface_extensions);

        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .context(DeviceInitErr { what: "instance" })?;

        let surface = unsafe { ash_window::create_surface(&entry, &instance, display, window, None) }
            .context(DeviceInitErr { what: "surface" })?;

        let surface_loader = khr::surface::Instance::new(&entry, &instance);

        let (physical, queue_family, raytracing) =
            Self::pick_physical(&instance, &surface_loader, surface, raytracing)?;

        let properties = unsafe { instance.get_physical_device_properties(physical) };
        info!(
            "Selected GPU: {:?}",
            properties.device_name_as_c_str().unwrap_or(c"<unnamed>")
        );

        let device = Self::create_device(&instance, physical, queue_family, raytracing)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let swapchain_loader = khr::swapchain::Device::new(&instance, &device);
        let accel_loader =
            raytracing.then(|| khr::acceleration_structure::Device::new(&instance, &device));

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: physical,
            debug_settings: Default::default(),
            buffer_device_address: raytracing,
            allocation_sizes: Default::default(),
        })
        .context(AllocatorInitErr)?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context(DeviceInitErr { what: "command pool" })?;

        Ok((
            DeviceContext {
                entry,
                instance,
                physical,
                device,
                queue,
                queue_family,
                limits: properties.limits,
                surface_loader,
                swapchain_loader,
                accel_loader,
                command_pool,
                allocator: Mutex::new(Some(allocator)),
            },
            surface,
        ))
    }

    fn pick_physical(
        instance: &ash::Instance,
        surface_loader: &khr::surface::Instance,
        surface: vk::SurfaceKHR,
        want_raytracing: bool,
    ) -> Result<(vk::PhysicalDevice, u32, bool)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context(DeviceInitErr { what: "physical device list" })?;

        let mut fallback = None;
        for pd in devices {
            let Some(family) = Self::find_queue_family(instance, surface_loader, surface, pd)
            else {
                continue;
            };

            let props = unsafe { instance.get_physical_device_properties(pd) };
            let discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
            let raytracing = want_raytracing && Self::supports_ray_query(instance, pd);

            if want_raytracing && !raytracing {
                debug!(
                    "GPU {:?} has no ray-query support",
                    props.device_name_as_c_str().unwrap_or(c"<unnamed>")
                );
            }

            if discrete {
                return Ok((pd, family, raytracing));
            }
            fallback.get_or_insert((pd, family, raytracing));
        }

        if want_raytracing && fallback.is_some_and(|(_, _, rt)| !rt) {
            warn!("Ray queries unavailable; hardware lighting features are disabled");
        }

        fallback.ok_or(RenderError::NoQueueFamily)
    }

    /// One family must cover graphics, compute and transfer; builds and
    /// uploads run on the same queue the draw submissions use.
    fn find_queue_family(
        instance: &ash::Instance,
        surface_loader: &khr::surface::Instance,
        surface: vk::SurfaceKHR,
        pd: vk::PhysicalDevice,
    ) -> Option<u32> {
        let wanted =
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;

        let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
        families.iter().enumerate().find_map(|(idx, family)| {
            let idx = idx as u32;
            let present = unsafe {
                surface_loader
                    .get_physical_device_surface_support(pd, idx, surface)
                    .unwrap_or(false)
            };
            (family.queue_flags.contains(wanted) && present).then_some(idx)
        })
    }

    fn supports_ray_query(instance: &ash::Instance, pd: vk::PhysicalDevice) -> bool {
        let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(pd) })
        else {
            return false;
        };

        let mut has_accel = false;
        let mut has_ray_query = false;
        for ext in &extensions {
            let Ok(name) = ext.extension_name_as_c_str() else {
                continue;
            };
            has_accel |= name == khr::acceleration_structure::NAME;
            has_ray_query |= name == khr::ray_query::NAME;
        }
        has_accel && has_ray_query
    }

    fn create_device(
        instance: &ash::Instance,
        physical: vk::PhysicalDevice,
        queue_family: u32,
        raytracing: bool,
    ) -> Result<ash::Device> {
        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities);

        let mut extensions = vec![khr::swapchain::NAME.as_ptr()];
        if raytracing {
            extensions.push(khr::acceleration_structure::NAME.as_ptr());
            extensions.push(khr::deferred_host_operations::NAME.as_ptr());
            extensions.push(khr::ray_query::NAME.as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .texture_compression_bc(true);

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(raytracing)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .shader_sampled_image_array_non_uniform_indexing(true);

        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                .acceleration_structure(true);
        let mut ray_query_features =
            vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);

        let queue_infos = [queue_info];
        let mut device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features12)
            .push_next(&mut features13);

        if raytracing {
            device_info = device_info
                .push_next(&mut accel_features)
                .push_next(&mut ray_query_features);
        }

        unsafe { instance.create_device(physical, &device_info, None) }
            .context(DeviceInitErr { what: "logical device" })
    }

    pub fn raytracing_enabled(&self) -> bool {
        self.accel_loader.is_some()
    }

    pub fn allocate_buffer(
        &self,
        name: &'static str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<GpuBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .context(CreateResourceErr { what: name })?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .allocator
            .lock()
            .as_mut()
            .expect("allocator outlives all allocations")
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context(AllocateErr { what: name })?;

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context(CreateResourceErr { what: name })?;
        }

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    pub fn allocate_image(
        &self,
        name: &'static str,
        info: &vk::ImageCreateInfo,
        aspect: vk::ImageAspectFlags,
    ) -> Result<GpuImage> {
        let image = unsafe { self.device.create_image(info, None) }
            .context(CreateResourceErr { what: name })?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self
            .allocator
            .lock()
            .as_mut()
            .expect("allocator outlives all allocations")
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context(AllocateErr { what: name })?;

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context(CreateResourceErr { what: name })?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(info.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .level_count(info.mip_levels)
                    .layer_count(info.array_layers),
            );
        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .context(CreateResourceErr { what: name })?;

        Ok(GpuImage {
            image,
            view,
            allocation: Some(allocation),
            format: info.format,
            extent: vk::Extent2D {
                width: info.extent.width,
                height: info.extent.height,
            },
        })
    }

    pub fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// Returns an allocation to the sub-allocator. Only the delete-list
    /// retirement path calls this, after the owning frame's fence.
    pub(crate) fn free_allocation(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                warn!("Leaked GPU allocation: {e}");
            }
        }
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            // The allocator logs leaks on drop; it has to go before the device.
            drop(self.allocator.lock().take());
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
