//! Deferred destruction of GPU resources.
//!
//! Anything referenced by in-flight GPU work lands here instead of being
//! destroyed synchronously. A [`DeleteList`] is replaced wholesale at the end
//! of each frame and only retired once the fence of the frame that referenced
//! its contents has been observed signaled.

use crate::device::{DeviceContext, GpuBuffer, GpuImage};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use tracing::trace;

pub enum DeferredItem {
    Buffer(vk::Buffer, Option<Allocation>),
    Image(vk::Image, Option<Allocation>),
    ImageView(vk::ImageView),
    DescriptorPool(vk::DescriptorPool),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

/// A bag of GPU-owned resources scheduled for destruction, tagged with the
/// epoch (frame number) whose fence proves they are unreferenced.
pub struct DeleteList {
    epoch: u64,
    items: Vec<DeferredItem>,
}

impl DeleteList {
    pub fn new(epoch: u64) -> Self {
        DeleteList {
            epoch,
            items: Vec::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push_buffer(&mut self, mut buffer: GpuBuffer) {
        self.items
            .push(DeferredItem::Buffer(buffer.buffer, buffer.allocation.take()));
    }

    pub fn push_image(&mut self, mut image: GpuImage) {
        self.items.push(DeferredItem::ImageView(image.view));
        self.items
            .push(DeferredItem::Image(image.image, image.allocation.take()));
    }

    pub fn push_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        self.items.push(DeferredItem::DescriptorPool(pool));
    }

    pub fn push_accel_struct(&mut self, accel: vk::AccelerationStructureKHR) {
        self.items.push(DeferredItem::AccelerationStructure(accel));
    }

    /// Destroys everything in the list.
    ///
    /// `completed_epoch` is the newest epoch whose fence has been observed
    /// signaled; retiring a younger list would free resources the GPU may
    /// still read.
    pub fn retire(self, device: &DeviceContext, completed_epoch: u64) {
        assert!(
            self.epoch <= completed_epoch,
            "delete list of epoch {} retired before its fence (completed epoch {})",
            self.epoch,
            completed_epoch,
        );

        if !self.items.is_empty() {
            trace!(epoch = self.epoch, count = self.items.len(), "retiring delete list");
        }

        for item in self.items {
            unsafe {
                match item {
                    DeferredItem::Buffer(buffer, allocation) => {
                        device.device.destroy_buffer(buffer, None);
                        if let Some(allocation) = allocation {
                            device.free_allocation(allocation);
                        }
                    }
                    DeferredItem::Image(image, allocation) => {
                        device.device.destroy_image(image, None);
                        if let Some(allocation) = allocation {
                            device.free_allocation(allocation);
                        }
                    }
                    DeferredItem::ImageView(view) => {
                        device.device.destroy_image_view(view, None);
                    }
                    DeferredItem::DescriptorPool(pool) => {
                        device.device.destroy_descriptor_pool(pool, None);
                    }
                    DeferredItem::AccelerationStructure(accel) => {
                        if let Some(loader) = &device.accel_loader {
                            loader.destroy_acceleration_structure(accel, None);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_list_is_empty_and_keeps_its_epoch() {
        let list = DeleteList::new(7);
        assert!(list.is_empty());
        assert_eq!(list.epoch(), 7);
    }

    #[test]
    fn items_accumulate_without_mutating_epoch() {
        let mut list = DeleteList::new(3);
        list.push_descriptor_pool(vk::DescriptorPool::null());
        list.push_accel_struct(vk::AccelerationStructureKHR::null());
        list.push_buffer(GpuBuffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 0,
        });

        assert_eq!(list.len(), 3);
        assert_eq!(list.epoch(), 3);
    }

    #[test]
    fn replacing_a_list_preserves_the_old_bag() {
        let mut current = DeleteList::new(1);
        current.push_descriptor_pool(vk::DescriptorPool::null());

        let old = std::mem::replace(&mut current, DeleteList::new(2));
        assert_eq!(old.epoch(), 1);
        assert_eq!(old.len(), 1);
        assert!(current.is_empty());
        assert_eq!(current.epoch(), 2);
    }
}
