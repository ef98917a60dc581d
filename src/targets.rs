// Render targets
//
// The render pass, depth attachment, and one framebuffer per
// swapchain image. These are the swapchain-dependent half of the
// drawing state: they get torn down and rebuilt on every resize,
// while the pipelines (dynamic viewport/scissor) stay put.
//
// Austin Shafer - 2025
use ash::vk;

use crate::device::Device;
use crate::{Result, SquallError};

use std::sync::Arc;

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub struct RenderTargets {
    t_dev: Arc<Device>,
    t_pass: vk::RenderPass,
    t_depth_image: vk::Image,
    t_depth_view: vk::ImageView,
    t_depth_mem: vk::DeviceMemory,
    t_framebuffers: Vec<vk::Framebuffer>,
    t_extent: vk::Extent2D,
}

impl RenderTargets {
    fn create_render_pass(dev: &Device, color_format: vk::Format) -> Result<vk::RenderPass> {
        let attachments = [
            vk::AttachmentDescription {
                format: color_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                ..Default::default()
            },
            vk::AttachmentDescription {
                format: DEPTH_FORMAT,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            },
        ];

        let color_ref = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_ref)
            .depth_stencil_attachment(&depth_ref)
            .build()];

        // Wait for the image to actually be acquired before we write
        // color, and for any earlier depth use to retire
        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::empty(),
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ..Default::default()
        }];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe {
            dev.dev
                .create_render_pass(&info, None)
                .or(Err(SquallError::PIPELINE_CREATE_FAILED))
        }
    }

    pub fn new(
        dev: Arc<Device>,
        color_format: vk::Format,
        extent: vk::Extent2D,
        views: &[vk::ImageView],
    ) -> Result<Self> {
        let pass = Self::create_render_pass(&dev, color_format)?;

        let mut ret = Self {
            t_dev: dev,
            t_pass: pass,
            t_depth_image: vk::Image::null(),
            t_depth_view: vk::ImageView::null(),
            t_depth_mem: vk::DeviceMemory::null(),
            t_framebuffers: Vec::new(),
            t_extent: extent,
        };
        ret.create_size_dependent(extent, views)?;
        Ok(ret)
    }

    fn create_size_dependent(
        &mut self,
        extent: vk::Extent2D,
        views: &[vk::ImageView],
    ) -> Result<()> {
        let (depth_image, depth_view, depth_mem) = self.t_dev.create_image(
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        self.t_depth_image = depth_image;
        self.t_depth_view = depth_view;
        self.t_depth_mem = depth_mem;
        self.t_extent = extent;

        for view in views.iter() {
            let attachments = [*view, self.t_depth_view];
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.t_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let fb = unsafe {
                self.t_dev
                    .dev
                    .create_framebuffer(&info, None)
                    .or(Err(SquallError::ALLOCATION_FAILED))?
            };
            self.t_framebuffers.push(fb);
        }
        Ok(())
    }

    fn destroy_size_dependent(&mut self) {
        unsafe {
            for fb in self.t_framebuffers.drain(..) {
                self.t_dev.dev.destroy_framebuffer(fb, None);
            }
            if self.t_depth_view != vk::ImageView::null() {
                self.t_dev.dev.destroy_image_view(self.t_depth_view, None);
                self.t_dev.dev.destroy_image(self.t_depth_image, None);
                self.t_dev.dev.free_memory(self.t_depth_mem, None);
                self.t_depth_view = vk::ImageView::null();
                self.t_depth_image = vk::Image::null();
                self.t_depth_mem = vk::DeviceMemory::null();
            }
        }
    }

    /// Rebuild the depth image and framebuffers for a recreated
    /// swapchain. The render pass itself survives, the formats did
    /// not change.
    pub fn rebuild(&mut self, extent: vk::Extent2D, views: &[vk::ImageView]) -> Result<()> {
        self.destroy_size_dependent();
        self.create_size_dependent(extent, views)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.t_pass
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.t_framebuffers[image_index as usize]
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.t_extent
    }
}

impl Drop for RenderTargets {
    fn drop(&mut self) {
        self.destroy_size_dependent();
        unsafe {
            self.t_dev.dev.destroy_render_pass(self.t_pass, None);
        }
    }
}
