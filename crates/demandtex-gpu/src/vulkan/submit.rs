//! Queue submission ordered by a timeline semaphore.
//!
//! Every batch the backend puts on its queue, command buffers and sparse
//! binds alike, waits for the previous timeline value and signals the next.
//! Binds and copies therefore execute in issue order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;

use super::device::DeviceShared;
use super::memory::{GpuAllocator, GpuBuffer};
use crate::backend::DeviceTimeline;
use crate::error::Result;

/// Timeline semaphore counting finished batches.
pub(crate) struct VulkanTimeline {
    shared: Arc<DeviceShared>,
    semaphore: vk::Semaphore,
    submitted: AtomicU64,
}

impl VulkanTimeline {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { shared.device.create_semaphore(&create_info, None)? };
        Ok(Self {
            shared,
            semaphore,
            submitted: AtomicU64::new(0),
        })
    }
}

impl DeviceTimeline for VulkanTimeline {
    fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    fn completed(&self) -> Result<u64> {
        Ok(unsafe { self.shared.device.get_semaphore_counter_value(self.semaphore)? })
    }

    fn wait(&self, value: u64) -> Result<()> {
        if value == 0 {
            return Ok(());
        }
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        unsafe { self.shared.device.wait_semaphores(&wait_info, u64::MAX)? };
        Ok(())
    }
}

impl Drop for VulkanTimeline {
    fn drop(&mut self) {
        unsafe {
            let _ = self.shared.device.device_wait_idle();
            self.shared.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Resources of a submitted batch, freed once its value completes.
struct InFlight {
    value: u64,
    command_buffer: Option<vk::CommandBuffer>,
    staging: Vec<GpuBuffer>,
}

/// Records and submits the backend's work.
pub(crate) struct Submitter {
    shared: Arc<DeviceShared>,
    timeline: Arc<VulkanTimeline>,
    pool: vk::CommandPool,
    in_flight: Vec<InFlight>,
}

impl Submitter {
    pub(crate) fn new(shared: Arc<DeviceShared>, timeline: Arc<VulkanTimeline>) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(shared.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { shared.device.create_command_pool(&create_info, None)? };
        Ok(Self {
            shared,
            timeline,
            pool,
            in_flight: Vec::new(),
        })
    }

    /// Block until all submitted work has finished.
    pub(crate) fn finish(&self) -> Result<()> {
        self.timeline.wait(self.timeline.submitted())
    }

    /// Free the resources of finished batches.
    pub(crate) fn reclaim(&mut self, allocator: &mut GpuAllocator) -> Result<()> {
        let completed = self.timeline.completed()?;
        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|batch| batch.value <= completed);
        self.in_flight = pending;
        finished
            .into_iter()
            .try_for_each(|batch| self.release(batch.command_buffer, batch.staging, allocator))
    }

    fn release(
        &self,
        command_buffer: Option<vk::CommandBuffer>,
        staging: Vec<GpuBuffer>,
        allocator: &mut GpuAllocator,
    ) -> Result<()> {
        if let Some(cmd) = command_buffer {
            unsafe { self.shared.device.free_command_buffers(self.pool, &[cmd]) };
        }
        staging
            .into_iter()
            .try_for_each(|mut buffer| allocator.free_buffer(&mut buffer))
    }

    fn timeline_values(&self) -> ([u64; 1], [u64; 1]) {
        let last = self.timeline.submitted();
        ([last], [last + 1])
    }

    fn record<F>(&self, record: F) -> Result<vk::CommandBuffer>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.shared.device;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info)? }[0];

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let recorded = unsafe { device.begin_command_buffer(cmd, &begin_info) }.and_then(|()| {
            record(device, cmd);
            unsafe { device.end_command_buffer(cmd) }
        });
        if let Err(err) = recorded {
            unsafe { device.free_command_buffers(self.pool, &[cmd]) };
            return Err(err.into());
        }
        Ok(cmd)
    }

    /// Record and submit one command buffer after all earlier work.
    ///
    /// `staging` is freed once the batch finishes. Returns the batch's
    /// timeline value.
    pub(crate) fn submit_commands<F>(
        &mut self,
        allocator: &mut GpuAllocator,
        staging: Vec<GpuBuffer>,
        record: F,
    ) -> Result<u64>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        self.reclaim(allocator)?;
        let cmd = match self.record(record) {
            Ok(cmd) => cmd,
            Err(err) => {
                self.release(None, staging, allocator)?;
                return Err(err);
            }
        };

        let (wait_values, signal_values) = self.timeline_values();
        let semaphores = [self.timeline.semaphore];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let command_buffers = [cmd];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        let submitted = unsafe {
            self.shared
                .device
                .queue_submit(self.shared.queue, &[submit_info], vk::Fence::null())
        };
        if let Err(err) = submitted {
            self.release(Some(cmd), staging, allocator)?;
            return Err(err.into());
        }

        let value = signal_values[0];
        self.timeline.submitted.store(value, Ordering::Release);
        self.in_flight.push(InFlight {
            value,
            command_buffer: Some(cmd),
            staging,
        });
        Ok(value)
    }

    /// Bind or unbind sparse memory of `image` after all earlier work.
    pub(crate) fn bind_sparse(
        &mut self,
        allocator: &mut GpuAllocator,
        image: vk::Image,
        image_binds: &[vk::SparseImageMemoryBind],
        opaque_binds: &[vk::SparseMemoryBind],
    ) -> Result<u64> {
        self.reclaim(allocator)?;

        let (wait_values, signal_values) = self.timeline_values();
        let semaphores = [self.timeline.semaphore];
        let image_info = [vk::SparseImageMemoryBindInfo::default().image(image).binds(image_binds)];
        let opaque_info = [vk::SparseImageOpaqueMemoryBindInfo::default()
            .image(image)
            .binds(opaque_binds)];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let mut bind_info = vk::BindSparseInfo::default()
            .wait_semaphores(&semaphores)
            .signal_semaphores(&semaphores);
        if !image_binds.is_empty() {
            bind_info = bind_info.image_binds(&image_info);
        }
        if !opaque_binds.is_empty() {
            bind_info = bind_info.image_opaque_binds(&opaque_info);
        }
        let bind_info = bind_info.push_next(&mut timeline_info);

        unsafe {
            self.shared
                .device
                .queue_bind_sparse(self.shared.queue, &[bind_info], vk::Fence::null())?;
        }

        let value = signal_values[0];
        self.timeline.submitted.store(value, Ordering::Release);
        self.in_flight.push(InFlight {
            value,
            command_buffer: None,
            staging: Vec::new(),
        });
        Ok(value)
    }

    /// Wait for the device and free everything.
    pub(crate) fn destroy(&mut self, allocator: &mut GpuAllocator) {
        unsafe {
            let _ = self.shared.device.device_wait_idle();
        }
        for batch in std::mem::take(&mut self.in_flight) {
            if let Err(err) = self.release(batch.command_buffer, batch.staging, allocator) {
                tracing::warn!("Failed to release batch {}: {err}", batch.value);
            }
        }
        unsafe { self.shared.device.destroy_command_pool(self.pool, None) };
    }
}
