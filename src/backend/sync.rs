// Submission synchronization
//
// Every draw into a runtime image is one command buffer submission that the
// CPU waits on before the image is released back to the runtime. The
// runtime reads the image as soon as it is released, so the GPU must be
// done with it by then.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Command pool, one reusable command buffer, and the fence guarding it.
pub struct SubmitSync {
    device: Arc<VulkanDevice>,
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
}

impl SubmitSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }?[0];

        // Start signaled so the first submission does not wait
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe { device.device.create_fence(&fence_info, None) }?;

        Ok(Self {
            device: Arc::clone(device),
            command_pool,
            command_buffer,
            fence,
        })
    }

    /// Record with `record`, submit to the graphics queue and block until
    /// the GPU has finished.
    pub fn submit_and_wait(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let device = &self.device.device;
        unsafe {
            device.wait_for_fences(&[self.fence], true, u64::MAX)?;
            device.reset_fences(&[self.fence])?;
            device.reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;

            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(self.command_buffer, &begin_info)?;
            record(device, self.command_buffer);
            device.end_command_buffer(self.command_buffer)?;

            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
            device.queue_submit(self.device.graphics_queue, &[submit_info], self.fence)?;
            device.wait_for_fences(&[self.fence], true, u64::MAX)?;
        }
        Ok(())
    }
}

impl Drop for SubmitSync {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.wait_for_fences(&[self.fence], true, u64::MAX);
            self.device.device.destroy_fence(self.fence, None);
            self.device.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
