//! Command buffer ring: a fixed pool of command buffers, each with its own
//! binary semaphore and fence.
//!
//! Submissions chain on the GPU through the previous submission's binary
//! semaphore (`last_submit`), and optionally signal the context's timeline
//! semaphore at a caller-chosen value for swapchain pacing.

use crate::debug::DebugUtils;
use crate::error::Result;
use crate::sync;
use ash::vk;
use std::sync::Arc;

/// Size of the command buffer ring.
pub const MAX_COMMAND_BUFFERS: usize = 64;

/// Identifies one submission: a ring slot plus the submission id stamped
/// into it. Id 0 is reserved for the empty handle, so a recycled slot never
/// compares equal to a stale handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitHandle {
    pub buffer_index: u32,
    pub submit_id: u32,
}

impl SubmitHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.submit_id == 0
    }
}

/// Next submission id: monotonic, wraps, skips 0.
fn next_submit_id(id: u32) -> u32 {
    match id.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

struct CommandBufferSlot {
    /// The buffer allocated for this slot, live for the pool's lifetime.
    allocated: vk::CommandBuffer,
    /// Currently-used buffer; null means the slot is free.
    active: vk::CommandBuffer,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    handle: SubmitHandle,
    is_encoding: bool,
}

impl CommandBufferSlot {
    fn is_free(&self) -> bool {
        self.active == vk::CommandBuffer::null()
    }
}

/// Fixed-size ring of command buffers over one queue.
pub struct CommandPool {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    raw: vk::CommandPool,
    slots: Vec<CommandBufferSlot>,
    available: u32,
    /// Binary semaphore the next submission must wait on (swapchain acquire).
    wait_semaphore: vk::Semaphore,
    /// Timeline semaphore the next submission signals, at `signal_value`.
    signal_semaphore: vk::Semaphore,
    signal_value: u64,
    /// Binary semaphore of the most recent submission; consumed once by the
    /// swapchain present.
    last_submit_semaphore: vk::Semaphore,
    last_submit_handle: SubmitHandle,
    next_submit_handle: SubmitHandle,
    submit_counter: u32,
}

impl CommandPool {
    /// Create the ring: one transient, resettable pool plus
    /// `MAX_COMMAND_BUFFERS` pre-allocated primary buffers with their
    /// semaphores and fences.
    ///
    /// # Safety
    /// The device and queue family must be valid.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        debug: &DebugUtils,
        queue_family: u32,
    ) -> Result<Self> {
        let queue = device.get_device_queue(queue_family, 0);

        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );
        let raw = device.create_command_pool(&create_info, None)?;
        debug.set_object_name(raw, "command ring");

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(raw)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_COMMAND_BUFFERS as u32);
        let buffers = device.allocate_command_buffers(&alloc_info)?;

        let mut slots = Vec::with_capacity(MAX_COMMAND_BUFFERS);
        for (i, allocated) in buffers.into_iter().enumerate() {
            slots.push(CommandBufferSlot {
                allocated,
                active: vk::CommandBuffer::null(),
                semaphore: sync::create_semaphore(
                    &device,
                    debug,
                    &format!("command buffer semaphore {i}"),
                )?,
                fence: sync::create_fence(&device, debug, &format!("command buffer fence {i}"))?,
                handle: SubmitHandle {
                    buffer_index: i as u32,
                    submit_id: 0,
                },
                is_encoding: false,
            });
        }

        Ok(Self {
            device,
            queue,
            raw,
            slots,
            available: MAX_COMMAND_BUFFERS as u32,
            wait_semaphore: vk::Semaphore::null(),
            signal_semaphore: vk::Semaphore::null(),
            signal_value: 0,
            last_submit_semaphore: vk::Semaphore::null(),
            last_submit_handle: SubmitHandle::empty(),
            next_submit_handle: SubmitHandle::empty(),
            submit_counter: 1,
        })
    }

    /// Take a free slot and begin recording into it.
    ///
    /// When the ring is exhausted this spins on [`Self::try_reset`] until the
    /// GPU retires a buffer; the ring is the back-pressure point.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn acquire(&mut self) -> Result<(usize, vk::CommandBuffer)> {
        if self.available == 0 {
            self.try_reset()?;
        }
        while self.available == 0 {
            tracing::warn!("command ring exhausted, waiting for the GPU to retire a buffer");
            self.try_reset()?;
        }

        let index = self
            .slots
            .iter()
            .position(CommandBufferSlot::is_free)
            .expect("free count out of sync with slot states");

        let slot = &mut self.slots[index];
        slot.handle.submit_id = self.submit_counter;
        slot.active = slot.allocated;
        slot.is_encoding = true;
        self.available -= 1;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device.begin_command_buffer(slot.active, &begin_info)?;

        self.next_submit_handle = slot.handle;
        Ok((index, slot.allocated))
    }

    /// End recording and submit one slot.
    ///
    /// Waits: the pending wait semaphore (if registered) and the previous
    /// submission's binary semaphore. Signals: the slot's own binary
    /// semaphore, plus the pending timeline signal when one was programmed.
    /// Both pendings are cleared; the slot's semaphore and handle become the
    /// new `last_submit`.
    ///
    /// # Safety
    /// The device must be valid and the slot must be recording.
    pub unsafe fn submit(&mut self, index: usize) -> Result<SubmitHandle> {
        let (active, semaphore, fence, handle) = {
            let slot = &self.slots[index];
            assert!(slot.is_encoding, "submitting a command buffer that is not recording");
            (slot.active, slot.semaphore, slot.fence, slot.handle)
        };

        self.device.end_command_buffer(active)?;

        let mut wait_infos = Vec::with_capacity(2);
        if self.wait_semaphore != vk::Semaphore::null() {
            wait_infos.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(self.wait_semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
        }
        if self.last_submit_semaphore != vk::Semaphore::null() {
            wait_infos.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(self.last_submit_semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
        }

        let mut signal_infos = Vec::with_capacity(2);
        signal_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
        );
        if self.signal_semaphore != vk::Semaphore::null() {
            signal_infos.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(self.signal_semaphore)
                    .value(self.signal_value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
        }

        let buffer_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(active)];
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&buffer_infos)
            .signal_semaphore_infos(&signal_infos);

        self.device.queue_submit2(self.queue, &[submit_info], fence)?;

        self.last_submit_semaphore = semaphore;
        self.last_submit_handle = handle;
        self.wait_semaphore = vk::Semaphore::null();
        self.signal_semaphore = vk::Semaphore::null();
        self.signal_value = 0;

        self.slots[index].is_encoding = false;
        self.submit_counter = next_submit_id(self.submit_counter);

        Ok(self.last_submit_handle)
    }

    /// Poll every pending slot's fence without blocking; recycle the ones
    /// whose work has retired.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn try_reset(&mut self) -> Result<()> {
        for slot in self.slots.iter_mut() {
            if slot.is_free() || slot.is_encoding {
                continue;
            }

            match self.device.wait_for_fences(&[slot.fence], true, 0) {
                Ok(()) => {
                    self.device
                        .reset_command_buffer(slot.active, vk::CommandBufferResetFlags::empty())?;
                    self.device.reset_fences(&[slot.fence])?;
                    slot.active = vk::CommandBuffer::null();
                    self.available += 1;
                }
                Err(vk::Result::TIMEOUT) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Wait until the submission behind `handle` has retired.
    ///
    /// The empty handle waits for the whole device to go idle. A handle whose
    /// slot was recycled since has already retired and returns immediately.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&mut self, handle: SubmitHandle) -> Result<()> {
        if handle.is_empty() {
            self.device.device_wait_idle()?;
            return Ok(());
        }

        let slot = &self.slots[handle.buffer_index as usize];
        if slot.is_free() || slot.handle.submit_id != handle.submit_id {
            return Ok(());
        }
        assert!(!slot.is_encoding, "waiting on a command buffer that was never submitted");

        self.device.wait_for_fences(&[slot.fence], true, u64::MAX)?;
        self.try_reset()
    }

    /// Wait for every pending submission, then recycle all retired slots.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_all(&mut self) -> Result<()> {
        let fences: Vec<vk::Fence> = self
            .slots
            .iter()
            .filter(|slot| !slot.is_free() && !slot.is_encoding)
            .map(|slot| slot.fence)
            .collect();

        if !fences.is_empty() {
            self.device.wait_for_fences(&fences, true, u64::MAX)?;
        }

        self.try_reset()
    }

    /// Whether the submission behind `handle` has retired.
    ///
    /// With `fast_check` the fence is not polled; only recycled slots count
    /// as ready. This is the path the deferred-task queue uses every frame.
    pub fn is_ready(&self, handle: SubmitHandle, fast_check: bool) -> bool {
        if handle.is_empty() {
            return true;
        }

        let index = handle.buffer_index as usize;
        assert!(index < MAX_COMMAND_BUFFERS, "submit handle out of range");

        let slot = &self.slots[index];
        if slot.is_free() {
            return true;
        }
        if slot.handle.submit_id != handle.submit_id {
            return true;
        }
        if fast_check {
            return false;
        }

        unsafe { self.device.wait_for_fences(&[slot.fence], true, 0).is_ok() }
    }

    /// Register the binary semaphore the next submission must wait on.
    /// At most one may be pending at a time.
    pub fn wait_semaphore(&mut self, semaphore: vk::Semaphore) {
        assert!(
            self.wait_semaphore == vk::Semaphore::null(),
            "a pending wait semaphore is already registered"
        );
        self.wait_semaphore = semaphore;
    }

    /// Program the next submission to signal `semaphore` (timeline) at `value`.
    pub fn signal(&mut self, semaphore: vk::Semaphore, value: u64) {
        assert!(semaphore != vk::Semaphore::null(), "signal semaphore must be valid");
        self.signal_semaphore = semaphore;
        self.signal_value = value;
    }

    /// Hand the most recent submission's binary semaphore to the caller and
    /// clear it. Single-use: the present path consumes it.
    pub fn acquire_last_submit_semaphore(&mut self) -> vk::Semaphore {
        std::mem::replace(&mut self.last_submit_semaphore, vk::Semaphore::null())
    }

    /// Handle of the submission currently being recorded, or of the next one
    /// to be recorded.
    pub fn next_submit_handle(&self) -> SubmitHandle {
        self.next_submit_handle
    }

    /// Handle of the most recent submission.
    pub fn last_submit_handle(&self) -> SubmitHandle {
        self.last_submit_handle
    }

    /// Wait for all pending work, then destroy every slot and the pool.
    ///
    /// # Safety
    /// The device must be valid; nothing may use the pool afterwards.
    pub unsafe fn destroy(&mut self) {
        if let Err(e) = self.wait_all() {
            tracing::error!("failed to drain command ring on shutdown: {e}");
        }

        for slot in &self.slots {
            self.device.destroy_fence(slot.fence, None);
            self.device.destroy_semaphore(slot.semaphore, None);
        }
        self.slots.clear();

        self.device.destroy_command_pool(self.raw, None);
        self.raw = vk::CommandPool::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_handle_has_id_zero() {
        let empty = SubmitHandle::empty();
        assert!(empty.is_empty());
        assert_eq!(empty, SubmitHandle::default());
    }

    #[test]
    fn handles_compare_on_both_fields() {
        let a = SubmitHandle { buffer_index: 3, submit_id: 7 };
        let b = SubmitHandle { buffer_index: 3, submit_id: 8 };
        let c = SubmitHandle { buffer_index: 4, submit_id: 7 };
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, SubmitHandle { buffer_index: 3, submit_id: 7 });
    }

    #[test]
    fn submit_ids_skip_zero_on_wrap() {
        assert_eq!(next_submit_id(1), 2);
        assert_eq!(next_submit_id(u32::MAX - 1), u32::MAX);
        assert_eq!(next_submit_id(u32::MAX), 1);
    }

    #[test]
    fn submit_ids_are_strictly_increasing_until_wrap() {
        let mut id = 1u32;
        for _ in 0..1000 {
            let next = next_submit_id(id);
            assert!(next > id || id == u32::MAX);
            assert_ne!(next, 0);
            id = next;
        }
    }
}
