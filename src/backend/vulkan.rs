// Vulkan backend - draws into runtime-owned images
//
// Targets arrive as raw VkImage handles. Drawing is a full-image clear
// wrapped in the layout transitions a runtime expects:
// UNDEFINED -> TRANSFER_DST_OPTIMAL -> clear -> COLOR_ATTACHMENT_OPTIMAL
//
// `VulkanTargets` is the other half for the simulated runtime: it allocates
// real device-local images so the same backend path runs without a headset.

use anyhow::{Context, Result};
use ash::vk::{self, Handle};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::sync::SubmitSync;
use super::{GraphicsBackend, RenderError, VulkanDevice};
use crate::runtime::simulated::TargetAllocator;
use crate::runtime::{Extent2D, SwapchainCreateInfo, TargetHandle};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub struct VulkanBackend {
    device: Arc<VulkanDevice>,
    sync: Option<SubmitSync>,
    clear_color: [f32; 4],
}

impl VulkanBackend {
    pub fn new(device: Arc<VulkanDevice>, clear_color: [f32; 4]) -> Self {
        Self {
            device,
            sync: None,
            clear_color,
        }
    }

    fn record_clear(&self, device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
        let to_transfer = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_RANGE)
            .build();

        let to_attachment = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::COLOR_ATTACHMENT_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_RANGE)
            .build();

        let clear_value = vk::ClearColorValue {
            float32: self.clear_color,
        };

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_value,
                &[COLOR_RANGE],
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_attachment],
            );
        }
    }
}

impl GraphicsBackend for VulkanBackend {
    fn initialize_device(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        let sync = SubmitSync::new(&self.device).map_err(|e| RenderError::device("initialize_device", e))?;
        self.sync = Some(sync);
        log::info!("Vulkan backend ready for {}x{} targets", width, height);
        Ok(())
    }

    fn render_to_target(&mut self, target: TargetHandle, extent: Extent2D) -> Result<(), RenderError> {
        let sync = self.sync.as_ref().ok_or(RenderError::Uninitialized)?;

        let image = vk::Image::from_raw(target.0);
        if image == vk::Image::null() || extent.width == 0 || extent.height == 0 {
            return Err(RenderError::TargetIncomplete(target));
        }

        sync.submit_and_wait(|device, cmd| self.record_clear(device, cmd, image))
            .map_err(|e| RenderError::device("render_to_target", e))
    }
}

/// Device-local images standing in for a runtime's swapchain images.
pub struct VulkanTargets {
    device: Arc<VulkanDevice>,
    images: Vec<(vk::Image, Allocation)>,
}

impl VulkanTargets {
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self {
            device,
            images: Vec::new(),
        }
    }

    fn create_image(&mut self, info: &SwapchainCreateInfo) -> Result<vk::Image> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: info.extent.width,
                height: info.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(vk::Format::from_raw(info.format as i32))
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let device = &self.device.device;
        let image = unsafe { device.create_image(&image_info, None) }.context("Failed to create target image")?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = self.device.with_allocator(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: "xr target",
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .context("Failed to allocate target image memory")
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
        // Tracked before binding so Drop releases it either way
        self.images.push((image, allocation));
        unsafe { device.bind_image_memory(image, memory, offset) }.context("Failed to bind target image memory")?;
        Ok(image)
    }
}

impl TargetAllocator for VulkanTargets {
    fn allocate(&mut self, info: &SwapchainCreateInfo, count: usize) -> Result<Vec<TargetHandle>, RenderError> {
        (0..count)
            .map(|_| {
                self.create_image(info)
                    .map(|image| TargetHandle(image.as_raw()))
                    .map_err(|e| RenderError::device("allocate_target", format!("{:#}", e)))
            })
            .collect()
    }
}

impl Drop for VulkanTargets {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        for (image, allocation) in self.images.drain(..) {
            unsafe { self.device.device.destroy_image(image, None) };
            if let Err(e) = self.device.with_allocator(|allocator| Ok(allocator.free(allocation)?)) {
                log::warn!("Failed to free target image memory: {:#}", e);
            }
        }
    }
}
