// Vulkan device representation
//
// This stores per-GPU state: the physical device we scored best, the
// logical device created on it, the graphics queue, and a small
// transfer setup for one-shot staging copies.
//
// Austin Shafer - 2025
use ash::extensions::khr;
use ash::vk;

use crate::instance::Instance;
use crate::{Result, SquallError};

use std::ffi::CStr;
use std::sync::Arc;

/// Squall Device
///
/// This holds all of the Vulkan logic for one GPU. Wrappers that
/// create device objects hold an `Arc<Device>` so teardown order
/// falls out of the reference graph: the device cannot drop while
/// any buffer, swapchain, or pipeline made from it is alive.
pub struct Device {
    /// The instance this device was created from
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// the physical device selected to render on
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    /// Device limits captured at selection, used to re-clamp config
    pub(crate) limits: vk::PhysicalDeviceLimits,
    /// Graphics queue family index. All submission happens here.
    pub(crate) graphics_family: u32,
    pub(crate) graphics_queue: vk::Queue,

    /// One-shot transfer state for staging copies
    transfer_pool: vk::CommandPool,
    transfer_fence: vk::Fence,
}

// The raw handles in here only reference vulkan objects, which are
// fine to move across threads as long as use is externally
// synchronized. The resource worker relies on this to drop buffers.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    /// Find the first queue family with graphics support.
    fn find_graphics_family(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Option<u32> {
        let props = unsafe { inst.get_physical_device_queue_family_properties(pdev) };

        props
            .iter()
            .enumerate()
            .find(|(_, info)| info.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(index, _)| index as u32)
    }

    /// Score a physical device for suitability.
    ///
    /// Discrete beats integrated beats virtual beats CPU. A device
    /// with no graphics queue or no geometry shader support scores
    /// zero and is never picked.
    fn rate_device(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> u32 {
        if Self::find_graphics_family(inst, pdev).is_none() {
            return 0;
        }

        let features = unsafe { inst.get_physical_device_features(pdev) };
        if features.geometry_shader == vk::FALSE {
            return 0;
        }

        let props = unsafe { inst.get_physical_device_properties(pdev) };
        match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            vk::PhysicalDeviceType::CPU => 10,
            _ => 1,
        }
    }

    /// Create a vkDevice on the best physical device present.
    pub fn new(instance: Arc<Instance>) -> Result<Arc<Device>> {
        let inst = &instance.inst;

        let pdevs = unsafe {
            inst.enumerate_physical_devices()
                .or(Err(SquallError::NO_VULKAN_DEVICE))?
        };
        if pdevs.is_empty() {
            log::error!("No Vulkan physical devices found");
            return Err(SquallError::NO_VULKAN_DEVICE);
        }

        let mut best_score = 0;
        let mut best_pdev = None;
        for pdev in pdevs.iter() {
            let score = Self::rate_device(inst, *pdev);
            let props = unsafe { inst.get_physical_device_properties(*pdev) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
            log::info!("Physical device: {:?} - score {}", name, score);

            if score > best_score {
                best_score = score;
                best_pdev = Some(*pdev);
            }
        }

        let pdev = match best_pdev {
            Some(p) => p,
            None => {
                // Distinguish "no graphics queue anywhere" from "no
                // geometry shaders" for the diagnostic
                if pdevs
                    .iter()
                    .all(|p| Self::find_graphics_family(inst, *p).is_none())
                {
                    log::error!("No physical device has a graphics queue family");
                    return Err(SquallError::GRAPHICS_QUEUE_MISSING);
                }
                log::error!("No physical device supports geometry shaders");
                return Err(SquallError::GEOMETRY_SHADER_UNSUPPORTED);
            }
        };

        let graphics_family = Self::find_graphics_family(inst, pdev)
            .ok_or(SquallError::GRAPHICS_QUEUE_MISSING)?;

        let props = unsafe { inst.get_physical_device_properties(pdev) };
        let mem_props = unsafe { inst.get_physical_device_memory_properties(pdev) };

        // The features our shaders depend on. Storing to SSBOs from
        // the vertex stage is how the visible index list is consumed.
        let features = vk::PhysicalDeviceFeatures::builder()
            .geometry_shader(true)
            .vertex_pipeline_stores_and_atomics(true)
            .fragment_stores_and_atomics(true)
            .multi_draw_indirect(true)
            .build();

        let priorities = [1.0];
        let queue_info = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_family)
            .queue_priorities(&priorities)
            .build()];

        let dev_extension_names = [khr::Swapchain::name().as_ptr()];

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&dev_extension_names)
            .enabled_features(&features)
            .build();

        let dev = unsafe {
            inst.create_device(pdev, &dev_create_info, None)
                .or(Err(SquallError::NO_SUITABLE_DEVICE))?
        };

        let graphics_queue = unsafe { dev.get_device_queue(graphics_family, 0) };

        // Transient pool for one-shot staging copies
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(graphics_family);
        let transfer_pool = unsafe {
            dev.create_command_pool(&pool_info, None)
                .or(Err(SquallError::ALLOCATION_FAILED))?
        };
        let transfer_fence = unsafe {
            dev.create_fence(&vk::FenceCreateInfo::default(), None)
                .or(Err(SquallError::ALLOCATION_FAILED))?
        };

        Ok(Arc::new(Device {
            inst: instance,
            dev,
            pdev,
            mem_props,
            limits: props.limits,
            graphics_family,
            graphics_queue,
            transfer_pool,
            transfer_fence,
        }))
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    /// Select the first memory type matching both the requirement
    /// mask and the requested property flags.
    pub(crate) fn find_memory_type_index(
        &self,
        reqs: &vk::MemoryRequirements,
        props: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for (i, mem_type) in self.mem_props.memory_types.iter().enumerate() {
            if i >= self.mem_props.memory_type_count as usize {
                break;
            }
            if reqs.memory_type_bits & (1 << i) != 0
                && mem_type.property_flags.contains(props)
            {
                return Some(i as u32);
            }
        }
        None
    }

    /// Create a 2D image, view, and backing memory in one go.
    ///
    /// Used for the depth attachment. The caller owns the returned
    /// handles and must destroy them.
    pub(crate) fn create_image(
        &self,
        resolution: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Image, vk::ImageView, vk::DeviceMemory)> {
        unsafe {
            let image_info = vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .format(format)
                .extent(vk::Extent3D {
                    width: resolution.width,
                    height: resolution.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let image = self
                .dev
                .create_image(&image_info, None)
                .or(Err(SquallError::ALLOCATION_FAILED))?;

            let reqs = self.dev.get_image_memory_requirements(image);
            let mem_type = match self.find_memory_type_index(&reqs, props) {
                Some(t) => t,
                None => {
                    self.dev.destroy_image(image, None);
                    return Err(SquallError::NO_SUITABLE_MEMORY_TYPE);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(reqs.size)
                .memory_type_index(mem_type);
            let mem = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_image(image, None);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            };

            if self.dev.bind_image_memory(image, mem, 0).is_err() {
                self.dev.free_memory(mem, None);
                self.dev.destroy_image(image, None);
                return Err(SquallError::ALLOCATION_FAILED);
            }

            let view_info = vk::ImageViewCreateInfo::builder()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(image);
            let view = match self.dev.create_image_view(&view_info, None) {
                Ok(v) => v,
                Err(_) => {
                    self.dev.free_memory(mem, None);
                    self.dev.destroy_image(image, None);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            };

            Ok((image, view, mem))
        }
    }

    /// Record and run a one-shot command buffer, waiting for it to
    /// complete.
    ///
    /// This is the staging copy path. It is deliberately synchronous:
    /// uploads happen at load time or for a handful of dirty slots,
    /// never per frame per object.
    pub(crate) fn execute_one_shot<F: FnOnce(vk::CommandBuffer)>(&self, record: F) -> Result<()> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.transfer_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cbuf = self
                .dev
                .allocate_command_buffers(&alloc_info)
                .or(Err(SquallError::ALLOCATION_FAILED))?[0];

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            if self.dev.begin_command_buffer(cbuf, &begin_info).is_err() {
                self.dev.free_command_buffers(self.transfer_pool, &[cbuf]);
                return Err(SquallError::RECORD_FAILED);
            }

            record(cbuf);

            if self.dev.end_command_buffer(cbuf).is_err() {
                self.dev.free_command_buffers(self.transfer_pool, &[cbuf]);
                return Err(SquallError::RECORD_FAILED);
            }

            let cbufs = [cbuf];
            let submit = vk::SubmitInfo::builder().command_buffers(&cbufs).build();

            let ret = self
                .dev
                .queue_submit(self.graphics_queue, &[submit], self.transfer_fence)
                .and_then(|_| {
                    self.dev
                        .wait_for_fences(&[self.transfer_fence], true, std::u64::MAX)
                })
                .and_then(|_| self.dev.reset_fences(&[self.transfer_fence]))
                .or(Err(SquallError::SUBMIT_FAILED));

            self.dev.free_command_buffers(self.transfer_pool, &[cbuf]);
            ret
        }
    }

    /// Block until the GPU has finished all outstanding work.
    pub fn wait_idle(&self) {
        unsafe {
            // Nothing useful can be done if this fails, the teardown
            // paths that call us are already on their way out
            let _ = self.dev.device_wait_idle();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.dev.destroy_fence(self.transfer_fence, None);
            self.dev.destroy_command_pool(self.transfer_pool, None);
            self.dev.destroy_device(None);
        }
    }
}
