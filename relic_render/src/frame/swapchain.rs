//! Swapchain creation, acquisition and presentation.

use crate::device::DeviceContext;
use crate::error::*;
use ash::vk;
use snafu::ResultExt;
use tracing::{debug, info};

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        device: &DeviceContext,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        vsync: bool,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let capabilities = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_capabilities(device.physical, surface)
        }
        .context(SwapchainCreateErr)?;

        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical, surface)
        }
        .context(SwapchainCreateErr)?;

        let surface_format = formats
            .iter()
            .copied()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .unwrap_or(formats[0]);

        let present_mode = Self::pick_present_mode(device, surface, vsync)?;

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };

        let mut min_image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count != 0 {
            min_image_count = min_image_count.min(capabilities.max_image_count);
        }

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |o| o.handle));

        let handle = unsafe { device.swapchain_loader.create_swapchain(&info, None) }
            .context(SwapchainCreateErr)?;

        let images = unsafe { device.swapchain_loader.get_swapchain_images(handle) }
            .context(SwapchainCreateErr)?;

        let mut views = Vec::with_capacity(images.len());
        for image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            views.push(
                unsafe { device.device.create_image_view(&view_info, None) }
                    .context(SwapchainCreateErr)?,
            );
        }

        info!(
            "Swapchain {}x{} ({:?}, {:?}, {} images)",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len()
        );

        Ok(Swapchain {
            handle,
            images,
            views,
            format: surface_format.format,
            extent,
        })
    }

    fn pick_present_mode(
        device: &DeviceContext,
        surface: vk::SurfaceKHR,
        vsync: bool,
    ) -> Result<vk::PresentModeKHR> {
        // FIFO is the only mode the spec guarantees.
        if vsync {
            return Ok(vk::PresentModeKHR::FIFO);
        }

        let modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical, surface)
        }
        .context(SwapchainCreateErr)?;

        for wanted in [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX] {
            if modes.contains(&wanted) {
                return Ok(wanted);
            }
        }
        Ok(vk::PresentModeKHR::FIFO)
    }

    /// Acquires the next presentable image.
    ///
    /// Returns `None` when acquisition loses a resize race; the caller skips
    /// presentation for the frame but keeps drawing so state stays coherent.
    pub fn acquire(
        &self,
        device: &DeviceContext,
        signal: vk::Semaphore,
    ) -> Option<u32> {
        let result = unsafe {
            device.swapchain_loader.acquire_next_image(
                self.handle,
                u64::MAX,
                signal,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, _suboptimal)) => Some(index),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                debug!("Swapchain out of date during acquire; frame not presented");
                None
            }
            Err(e) => {
                debug!("Swapchain acquire failed ({e}); frame not presented");
                None
            }
        }
    }

    /// Queues the present. An out-of-date swapchain is not an error; the next
    /// frame recreates it.
    pub fn present(
        &self,
        device: &DeviceContext,
        wait: vk::Semaphore,
        image_index: u32,
    ) -> Result<()> {
        let swapchains = [self.handle];
        let waits = [wait];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let result = unsafe { device.swapchain_loader.queue_present(device.queue, &info) };
        match result {
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                Ok(())
            }
            Err(e) => Err(e).context(QueueSubmitErr),
        }
    }

    pub fn destroy(self, device: &DeviceContext) {
        unsafe {
            for view in self.views {
                device.device.destroy_image_view(view, None);
            }
            device.swapchain_loader.destroy_swapchain(self.handle, None);
        }
    }
}
