//! Per-frame command-buffer lifecycle and queue submission.
//!
//! [`FrameSubmitter`] owns the transfer/draw command-buffer pair, the
//! swapchain, every synchronization primitive of the frame loop and the
//! deferred-deletion list. The backend runs a single frame in flight: the CPU
//! blocks on the frame fence inside [`FrameSubmitter::submit_commands`] before
//! any buffer is reused. That is a deliberate latency/simplicity trade-off,
//! not an oversight; it makes the delete-list retirement point trivial to
//! reason about.

mod delete_list;
mod pacer;
mod swapchain;

pub use delete_list::{DeferredItem, DeleteList};
pub use pacer::FramePacer;
pub use swapchain::Swapchain;

use crate::device::DeviceContext;
use crate::error::*;
use ash::vk;
use snafu::ResultExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// The persistent transfer/draw command-buffer pair plus which of the two the
/// current frame has opened for recording. The same two buffers are reset and
/// reused every frame; nothing is allocated from the pool after construction.
struct FrameCommands {
    transfer: vk::CommandBuffer,
    draw: vk::CommandBuffer,
    transfer_open: bool,
    draw_open: bool,
}

impl FrameCommands {
    fn new(transfer: vk::CommandBuffer, draw: vk::CommandBuffer) -> Self {
        FrameCommands {
            transfer,
            draw,
            transfer_open: false,
            draw_open: false,
        }
    }

    /// The transfer buffer, plus whether this call opened it. The caller must
    /// reset and begin the buffer exactly when `true` comes back.
    fn transfer(&mut self) -> (vk::CommandBuffer, bool) {
        let opened = !self.transfer_open;
        self.transfer_open = true;
        (self.transfer, opened)
    }

    fn draw(&mut self) -> (vk::CommandBuffer, bool) {
        let opened = !self.draw_open;
        self.draw_open = true;
        (self.draw, opened)
    }

    fn draw_open(&self) -> bool {
        self.draw_open
    }

    /// Closes the frame, returning the buffers that were recorded into.
    fn take_open(&mut self) -> (Option<vk::CommandBuffer>, Option<vk::CommandBuffer>) {
        let transfer = self.transfer_open.then_some(self.transfer);
        let draw = self.draw_open.then_some(self.draw);
        self.transfer_open = false;
        self.draw_open = false;
        (transfer, draw)
    }

    fn handles(&self) -> [vk::CommandBuffer; 2] {
        [self.transfer, self.draw]
    }
}

/// Wait/signal wiring of one frame's submissions, decided purely from which
/// batches exist and whether a swapchain image was acquired.
///
/// A binary semaphore signaled by `acquire` must be waited on before the next
/// acquire reuses it. When the frame recorded no draw batch, that wait rides
/// the transfer batch, or an otherwise empty batch when there is no transfer
/// work either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubmitPlan {
    presenting: bool,
    transfer_waits_acquire: bool,
    unsignal_batch: bool,
    fence_on_transfer: bool,
}

fn submit_plan(has_transfer: bool, has_draw: bool, acquired: bool, present: bool) -> SubmitPlan {
    let orphaned_acquire = acquired && !has_draw;
    SubmitPlan {
        presenting: present && acquired && has_draw,
        transfer_waits_acquire: orphaned_acquire && has_transfer,
        unsignal_batch: orphaned_acquire && !has_transfer,
        fence_on_transfer: has_transfer && !has_draw,
    }
}

pub struct FrameSubmitter {
    device: Arc<DeviceContext>,
    surface: vk::SurfaceKHR,
    swapchain: Option<Swapchain>,

    commands: FrameCommands,

    transfer_done: vk::Semaphore,
    image_available: vk::Semaphore,
    // One per swapchain image; present may still be waiting on the semaphore
    // of an earlier image when the next frame is submitted.
    render_finished: Vec<vk::Semaphore>,
    frame_fence: vk::Fence,

    delete_list: DeleteList,
    epoch: u64,
    completed_epoch: u64,

    acquired: Option<u32>,
    pacer: FramePacer,
    vsync: bool,
}

impl FrameSubmitter {
    pub fn new(
        device: Arc<DeviceContext>,
        surface: vk::SurfaceKHR,
        vsync: bool,
        fps_cap: Option<u32>,
    ) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let transfer_done = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .context(CreateResourceErr { what: "transfer semaphore" })?;
        let image_available = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .context(CreateResourceErr { what: "acquire semaphore" })?;

        let fence_info = vk::FenceCreateInfo::default();
        let frame_fence = unsafe { device.device.create_fence(&fence_info, None) }
            .context(CreateResourceErr { what: "frame fence" })?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(2);
        let buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context(CommandRecordErr)?;

        Ok(FrameSubmitter {
            device,
            surface,
            swapchain: None,
            commands: FrameCommands::new(buffers[0], buffers[1]),
            transfer_done,
            image_available,
            render_finished: Vec::new(),
            frame_fence,
            delete_list: DeleteList::new(1),
            epoch: 1,
            completed_epoch: 0,
            acquired: None,
            pacer: FramePacer::new(fps_cap),
            vsync,
        })
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn delete_list_mut(&mut self) -> &mut DeleteList {
        &mut self.delete_list
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn completed_epoch(&self) -> u64 {
        self.completed_epoch
    }

    /// No frame has been submitted yet (caches may be cleared freely).
    pub fn no_frame_submitted(&self) -> bool {
        self.epoch == 1
    }

    /// The current frame's transfer command buffer, reset and begun on first
    /// call.
    #[profiling::function]
    pub fn transfer_commands(&mut self) -> Result<vk::CommandBuffer> {
        let (cmd, opened) = self.commands.transfer();
        if opened {
            self.begin_command_buffer(cmd)?;
        }
        Ok(cmd)
    }

    /// The current frame's draw command buffer, reset and begun on first
    /// call.
    #[profiling::function]
    pub fn draw_commands(&mut self) -> Result<vk::CommandBuffer> {
        let (cmd, opened) = self.commands.draw();
        if opened {
            self.begin_command_buffer(cmd)?;
        }
        Ok(cmd)
    }

    pub fn has_draw_commands(&self) -> bool {
        self.commands.draw_open()
    }

    /// The fence wait in `submit_commands` proved the previous use complete,
    /// so the buffer is safe to reset here.
    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .context(CommandRecordErr)?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.device.begin_command_buffer(cmd, &begin_info) }
            .context(CommandRecordErr)?;

        Ok(())
    }

    /// Recreates the swapchain when absent or when the output size changed,
    /// then acquires the next image. `None` means the acquire lost a resize
    /// race; drawing continues, presentation is skipped this frame.
    pub fn acquire_image(&mut self, width: u32, height: u32) -> Result<Option<(u32, vk::ImageView)>> {
        if let Some(index) = self.acquired {
            let view = self.swapchain.as_ref().map(|sc| sc.views[index as usize]);
            return Ok(view.map(|v| (index, v)));
        }

        let stale = self.swapchain.as_ref().is_some_and(|sc| {
            sc.extent.width != width || sc.extent.height != height
        });
        if stale || self.swapchain.is_none() {
            self.recreate_swapchain(width, height)?;
        }

        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(None);
        };

        match swapchain.acquire(&self.device, self.image_available) {
            Some(index) => {
                self.acquired = Some(index);
                Ok(Some((index, swapchain.views[index as usize])))
            }
            None => {
                // Drop the stale chain now; next frame rebuilds it. The
                // acquire did not signal, so the semaphore stays reusable.
                self.recreate_swapchain(width, height)?;
                Ok(None)
            }
        }
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        // The old chain may still be scanned out; drain the pipe first.
        self.device.wait_idle();

        let new = Swapchain::new(
            &self.device,
            self.surface,
            width,
            height,
            self.vsync,
            self.swapchain.as_ref(),
        )?;

        if let Some(old) = self.swapchain.take() {
            old.destroy(&self.device);
        }
        for semaphore in self.render_finished.drain(..) {
            unsafe { self.device.device.destroy_semaphore(semaphore, None) };
        }

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        for _ in 0..new.images.len() {
            self.render_finished.push(
                unsafe { self.device.device.create_semaphore(&semaphore_info, None) }
                    .context(CreateResourceErr { what: "present semaphore" })?,
            );
        }

        self.swapchain = Some(new);
        Ok(())
    }

    /// Closes and submits the frame's command buffers with the frame's
    /// wait/signal graph, blocks on the fence, presents, and swaps out the
    /// delete list. See the module docs for the single-frame-in-flight
    /// rationale.
    #[profiling::function]
    pub fn submit_commands(&mut self, present: bool, width: u32, height: u32) -> Result<()> {
        if present && self.acquired.is_none() && self.has_draw_commands() {
            // Acquire here when the caller didn't pre-acquire for recording.
            let _ = self.acquire_image(width, height)?;
        }

        let (transfer_cmd, draw_cmd) = self.commands.take_open();
        let acquired = self.acquired.take();

        let transfer_submitted = transfer_cmd.is_some();
        let plan = submit_plan(
            transfer_submitted,
            draw_cmd.is_some(),
            acquired.is_some(),
            present,
        );

        let mut fence_attached = false;

        if let Some(cmd) = transfer_cmd {
            unsafe { self.device.device.end_command_buffer(cmd) }.context(CommandRecordErr)?;

            let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
            let signals = [vk::SemaphoreSubmitInfo::default()
                .semaphore(self.transfer_done)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
            // An acquire no draw batch will wait on is unsignaled here, so
            // the binary semaphore is reusable next frame.
            let waits = [vk::SemaphoreSubmitInfo::default()
                .semaphore(self.image_available)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];

            let mut submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos);
            if draw_cmd.is_some() {
                submit = submit.signal_semaphore_infos(&signals);
            }
            if plan.transfer_waits_acquire {
                submit = submit.wait_semaphore_infos(&waits);
            }

            // No draw work this frame: the fence rides on the transfer batch.
            let fence = if plan.fence_on_transfer {
                fence_attached = true;
                self.frame_fence
            } else {
                vk::Fence::null()
            };

            unsafe {
                self.device
                    .device
                    .queue_submit2(self.device.queue, &[submit], fence)
            }
            .context(QueueSubmitErr)?;
        }

        if let Some(cmd) = draw_cmd {
            unsafe { self.device.device.end_command_buffer(cmd) }.context(CommandRecordErr)?;

            let mut waits = Vec::with_capacity(2);
            if transfer_submitted {
                waits.push(
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(self.transfer_done)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                );
            }
            if plan.presenting {
                waits.push(
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(self.image_available)
                        .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT),
                );
            }

            let mut signals = Vec::with_capacity(1);
            if plan.presenting {
                let index = acquired.unwrap_or_default() as usize;
                signals.push(
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(self.render_finished[index])
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                );
            }

            let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
            let submit = vk::SubmitInfo2::default()
                .wait_semaphore_infos(&waits)
                .command_buffer_infos(&cmd_infos)
                .signal_semaphore_infos(&signals);

            fence_attached = true;
            unsafe {
                self.device
                    .device
                    .queue_submit2(self.device.queue, &[submit], self.frame_fence)
            }
            .context(QueueSubmitErr)?;
        }

        if plan.unsignal_batch {
            // Acquired, but nothing was recorded this frame: an otherwise
            // empty batch consumes the acquire signal.
            let waits = [vk::SemaphoreSubmitInfo::default()
                .semaphore(self.image_available)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
            let submit = vk::SubmitInfo2::default().wait_semaphore_infos(&waits);

            fence_attached = true;
            unsafe {
                self.device
                    .device
                    .queue_submit2(self.device.queue, &[submit], self.frame_fence)
            }
            .context(QueueSubmitErr)?;
        }

        if fence_attached {
            // Unbounded wait: a hung driver stalls the process by design.
            unsafe {
                self.device
                    .device
                    .wait_for_fences(&[self.frame_fence], true, u64::MAX)
                    .context(FenceWaitErr)?;
                self.device
                    .device
                    .reset_fences(&[self.frame_fence])
                    .context(FenceWaitErr)?;
            }
        }

        // The fence proved this frame's GPU work complete (or none existed),
        // so everything the frame referenced is now safe to drop.
        self.completed_epoch = self.epoch;

        if plan.presenting {
            let index = acquired.unwrap_or_default();
            if let Some(swapchain) = &self.swapchain {
                swapchain.present(
                    &self.device,
                    self.render_finished[index as usize],
                    index,
                )?;
            }
        } else if present {
            debug!("Frame {} drawn but not presented", self.epoch);
        }

        self.epoch += 1;
        let retired = std::mem::replace(&mut self.delete_list, DeleteList::new(self.epoch));
        retired.retire(&self.device, self.completed_epoch);

        if !self.vsync {
            self.pacer.pace();
        }

        Ok(())
    }
}

impl Drop for FrameSubmitter {
    fn drop(&mut self) {
        self.device.wait_idle();

        let (transfer_cmd, draw_cmd) = self.commands.take_open();
        for cmd in [transfer_cmd, draw_cmd].into_iter().flatten() {
            unsafe {
                let _ = self.device.device.end_command_buffer(cmd);
            }
        }
        unsafe {
            self.device
                .device
                .free_command_buffers(self.device.command_pool, &self.commands.handles());
        }

        let list = std::mem::replace(&mut self.delete_list, DeleteList::new(u64::MAX));
        // Device idle: every epoch is complete.
        list.retire(&self.device, u64::MAX);

        unsafe {
            self.device.device.destroy_semaphore(self.transfer_done, None);
            self.device.device.destroy_semaphore(self.image_available, None);
            for semaphore in self.render_finished.drain(..) {
                self.device.device.destroy_semaphore(semaphore, None);
            }
            self.device.device.destroy_fence(self.frame_fence, None);
        }

        if let Some(swapchain) = self.swapchain.take() {
            swapchain.destroy(&self.device);
        }
        unsafe {
            self.device
                .surface_loader
                .destroy_surface(self.surface, None);
        }

        if self.epoch > 1 {
            debug!("Frame submitter shut down after {} frames", self.epoch - 1);
        } else {
            warn!("Frame submitter shut down before any frame was submitted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn pair() -> FrameCommands {
        FrameCommands::new(
            vk::CommandBuffer::from_raw(0x10),
            vk::CommandBuffer::from_raw(0x20),
        )
    }

    #[test]
    fn command_buffers_are_reused_across_frames() {
        let mut commands = pair();

        let (first, opened) = commands.transfer();
        assert!(opened);
        let (again, opened) = commands.transfer();
        assert!(!opened);
        assert_eq!(first, again);

        let (taken, _) = commands.take_open();
        assert_eq!(taken, Some(first));

        // Next frame hands out the same buffer, to be reset and begun anew.
        let (second_frame, opened) = commands.transfer();
        assert!(opened);
        assert_eq!(second_frame, first);
    }

    #[test]
    fn take_open_reports_only_recorded_buffers() {
        let mut commands = pair();
        let (draw, _) = commands.draw();
        assert!(commands.draw_open());

        let (transfer, taken_draw) = commands.take_open();
        assert_eq!(transfer, None);
        assert_eq!(taken_draw, Some(draw));
        assert!(!commands.draw_open());
    }

    #[test]
    fn full_frame_presents_with_fence_on_draw() {
        let plan = submit_plan(true, true, true, true);
        assert!(plan.presenting);
        assert!(!plan.fence_on_transfer);
        assert!(!plan.transfer_waits_acquire);
        assert!(!plan.unsignal_batch);
    }

    #[test]
    fn transfer_only_frame_carries_the_fence() {
        let plan = submit_plan(true, false, false, false);
        assert!(plan.fence_on_transfer);
        assert!(!plan.presenting);
        assert!(!plan.transfer_waits_acquire);
    }

    #[test]
    fn orphaned_acquire_is_waited_on_by_the_transfer_batch() {
        // Image acquired, transfer work recorded, but no draws: the transfer
        // submission must consume the acquire signal.
        let plan = submit_plan(true, false, true, true);
        assert!(plan.transfer_waits_acquire);
        assert!(!plan.unsignal_batch);
        assert!(!plan.presenting);
    }

    #[test]
    fn orphaned_acquire_without_any_work_gets_an_empty_batch() {
        let plan = submit_plan(false, false, true, false);
        assert!(plan.unsignal_batch);
        assert!(!plan.transfer_waits_acquire);
        assert!(!plan.fence_on_transfer);
    }

    #[test]
    fn present_request_without_an_image_does_not_present() {
        let plan = submit_plan(true, true, false, true);
        assert!(!plan.presenting);
        assert!(!plan.transfer_waits_acquire);
        assert!(!plan.unsignal_batch);
    }
}
