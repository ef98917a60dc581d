// Swapchain lifecycle
//
// Owns the surface and the swapchain built on it: format and present
// mode negotiation against what the driver reports, image count
// selection, image view creation, and recreation when the window
// resizes or the driver declares us out of date.
//
// Austin Shafer - 2025
use ash::extensions::khr;
use ash::vk;

use crate::config::{self, Config};
use crate::device::Device;
use crate::{Result, SquallError};

use std::sync::Arc;

/// Pick the surface format.
///
/// If the config asked for a specific format and color space, only
/// an exact match will do: a silent fallback would mean rendering in
/// a different color encoding than the user asked for. With no
/// preference we take B8G8R8A8_SRGB + SRGB_NONLINEAR when available,
/// else whatever the driver lists first.
fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred_format: Option<vk::Format>,
    preferred_color_space: Option<vk::ColorSpaceKHR>,
) -> Result<vk::SurfaceFormatKHR> {
    if formats.is_empty() {
        return Err(SquallError::FORMAT_UNSUPPORTED);
    }

    if preferred_format.is_some() || preferred_color_space.is_some() {
        for fmt in formats.iter() {
            let format_match = preferred_format.map(|f| f == fmt.format).unwrap_or(true);
            let space_match = preferred_color_space
                .map(|c| c == fmt.color_space)
                .unwrap_or(true);
            if format_match && space_match {
                return Ok(*fmt);
            }
        }

        let supported: Vec<String> = formats
            .iter()
            .map(|f| {
                format!(
                    "{}+{}",
                    config::format_to_str(f.format),
                    config::color_space_to_str(f.color_space)
                )
            })
            .collect();
        log::error!(
            "Requested surface format is not supported. Supported: {}. Adjust config and restart.",
            supported.join(", ")
        );
        return Err(SquallError::FORMAT_UNSUPPORTED);
    }

    for fmt in formats.iter() {
        if fmt.format == vk::Format::B8G8R8A8_SRGB
            && fmt.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        {
            return Ok(*fmt);
        }
    }
    Ok(formats[0])
}

/// Pick the present mode. Exact match only.
fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> Result<vk::PresentModeKHR> {
    if modes.iter().any(|m| *m == requested) {
        return Ok(requested);
    }

    let supported: Vec<String> = modes
        .iter()
        .map(|m| config::present_mode_to_str(*m))
        .collect();
    log::error!(
        "Requested present mode '{}' is not supported. Supported: {}. Adjust config and restart.",
        config::present_mode_to_str(requested),
        supported.join(", ")
    );
    Err(SquallError::PRESENT_MODE_UNSUPPORTED)
}

/// Pick the swapchain extent. Drivers that know the surface size
/// report it in current_extent; otherwise clamp what was asked for.
fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    requested_width: u32,
    requested_height: u32,
) -> vk::Extent2D {
    if caps.current_extent.width != std::u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested_width
            .max(caps.min_image_extent.width)
            .min(caps.max_image_extent.width),
        height: requested_height
            .max(caps.min_image_extent.height)
            .min(caps.max_image_extent.height),
    }
}

/// One more than the minimum so acquire rarely blocks on the driver,
/// clamped by the maximum when the driver has one.
fn desired_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count
}

pub struct Swapchain {
    sc_dev: Arc<Device>,
    sc_surface_loader: khr::Surface,
    sc_swapchain_loader: khr::Swapchain,
    sc_surface: vk::SurfaceKHR,
    sc_swapchain: vk::SwapchainKHR,
    sc_images: Vec<vk::Image>,
    sc_views: Vec<vk::ImageView>,
    sc_format: vk::SurfaceFormatKHR,
    sc_present_mode: vk::PresentModeKHR,
    sc_extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(dev: Arc<Device>, surface: vk::SurfaceKHR, config: &Config) -> Result<Self> {
        let surface_loader = khr::Surface::new(&dev.inst.loader, &dev.inst.inst);
        let swapchain_loader = khr::Swapchain::new(&dev.inst.inst, &dev.dev);

        let supported = unsafe {
            surface_loader
                .get_physical_device_surface_support(dev.pdev, dev.graphics_family, surface)
                .unwrap_or(false)
        };
        if !supported {
            log::error!("The graphics queue family cannot present to this surface");
            return Err(SquallError::SURFACE_CREATE_FAILED);
        }

        let mut ret = Self {
            sc_dev: dev,
            sc_surface_loader: surface_loader,
            sc_swapchain_loader: swapchain_loader,
            sc_surface: surface,
            sc_swapchain: vk::SwapchainKHR::null(),
            sc_images: Vec::new(),
            sc_views: Vec::new(),
            sc_format: vk::SurfaceFormatKHR::default(),
            sc_present_mode: vk::PresentModeKHR::FIFO,
            sc_extent: vk::Extent2D::default(),
        };
        ret.create_swapchain(config, config.window.width, config.window.height)?;
        Ok(ret)
    }

    fn create_swapchain(&mut self, config: &Config, width: u32, height: u32) -> Result<()> {
        let dev = self.sc_dev.clone();

        unsafe {
            let caps = self
                .sc_surface_loader
                .get_physical_device_surface_capabilities(dev.pdev, self.sc_surface)
                .or(Err(SquallError::SURFACE_CREATE_FAILED))?;
            let formats = self
                .sc_surface_loader
                .get_physical_device_surface_formats(dev.pdev, self.sc_surface)
                .or(Err(SquallError::FORMAT_UNSUPPORTED))?;
            let modes = self
                .sc_surface_loader
                .get_physical_device_surface_present_modes(dev.pdev, self.sc_surface)
                .or(Err(SquallError::PRESENT_MODE_UNSUPPORTED))?;

            let format = choose_surface_format(
                &formats,
                config.preferred_format(),
                config.preferred_color_space(),
            )?;
            let requested_mode = config
                .present_mode()
                .ok_or(SquallError::PRESENT_MODE_UNSUPPORTED)?;
            let present_mode = choose_present_mode(&modes, requested_mode)?;
            let extent = choose_extent(&caps, width, height);
            let image_count = desired_image_count(&caps);

            let transform = if caps
                .supported_transforms
                .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
            {
                vk::SurfaceTransformFlagsKHR::IDENTITY
            } else {
                caps.current_transform
            };

            let info = vk::SwapchainCreateInfoKHR::builder()
                .surface(self.sc_surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true)
                .old_swapchain(self.sc_swapchain);

            let new_swapchain = self
                .sc_swapchain_loader
                .create_swapchain(&info, None)
                .or(Err(SquallError::SURFACE_CREATE_FAILED))?;

            // The old swapchain was retired by the create call above,
            // now free our handles to it
            self.destroy_handles();
            self.sc_swapchain = new_swapchain;
            self.sc_format = format;
            self.sc_present_mode = present_mode;
            self.sc_extent = extent;

            self.sc_images = self
                .sc_swapchain_loader
                .get_swapchain_images(self.sc_swapchain)
                .or(Err(SquallError::SURFACE_CREATE_FAILED))?;

            for image in self.sc_images.iter() {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image(*image);
                let view = dev
                    .dev
                    .create_image_view(&view_info, None)
                    .or(Err(SquallError::SURFACE_CREATE_FAILED))?;
                self.sc_views.push(view);
            }
        }

        log::info!(
            "Swapchain: {} images, {}x{}, {:?}, {}",
            self.sc_images.len(),
            self.sc_extent.width,
            self.sc_extent.height,
            self.sc_format.format,
            config::present_mode_to_str(self.sc_present_mode),
        );
        Ok(())
    }

    fn destroy_handles(&mut self) {
        unsafe {
            for view in self.sc_views.drain(..) {
                self.sc_dev.dev.destroy_image_view(view, None);
            }
            self.sc_images.clear();
            if self.sc_swapchain != vk::SwapchainKHR::null() {
                self.sc_swapchain_loader
                    .destroy_swapchain(self.sc_swapchain, None);
                self.sc_swapchain = vk::SwapchainKHR::null();
            }
        }
    }

    /// Rebuild the swapchain for a new size or changed config.
    ///
    /// The caller is responsible for waiting device idle first and
    /// for rebuilding everything keyed to the images (framebuffers,
    /// depth, per-image semaphores). Graphics pipelines survive, they
    /// use dynamic viewport/scissor state.
    pub fn recreate(&mut self, config: &Config, width: u32, height: u32) -> Result<()> {
        self.create_swapchain(config, width, height)
    }

    pub fn image_count(&self) -> u32 {
        self.sc_images.len() as u32
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.sc_views
    }

    pub fn format(&self) -> vk::Format {
        self.sc_format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.sc_extent
    }

    /// Acquire the next image, signaling `sema` when it is ready.
    ///
    /// Returns the image index and whether the swapchain is
    /// suboptimal. An out-of-date swapchain is an error enumerator,
    /// the frame loop recreates and retries.
    pub fn acquire(&mut self, sema: vk::Semaphore) -> Result<(u32, bool)> {
        unsafe {
            match self.sc_swapchain_loader.acquire_next_image(
                self.sc_swapchain,
                std::u64::MAX,
                sema,
                vk::Fence::null(),
            ) {
                Ok((index, suboptimal)) => Ok((index, suboptimal)),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(SquallError::OUT_OF_DATE),
                Err(_) => Err(SquallError::COULD_NOT_ACQUIRE_NEXT_IMAGE),
            }
        }
    }

    /// Present `image_index`, waiting on `wait_sema`.
    ///
    /// `wait_sema` must be the render-finished semaphore keyed by
    /// this image index. Returns whether the swapchain is suboptimal.
    pub fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_sema: vk::Semaphore,
    ) -> Result<bool> {
        let wait_semas = [wait_sema];
        let swapchains = [self.sc_swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        unsafe {
            match self.sc_swapchain_loader.queue_present(queue, &info) {
                Ok(suboptimal) => Ok(suboptimal),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(SquallError::OUT_OF_DATE),
                Err(_) => Err(SquallError::PRESENT_FAILED),
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_handles();
        unsafe {
            self.sc_surface_loader.destroy_surface(self.sc_surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(f: vk::Format, c: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: f,
            color_space: c,
        }
    }

    #[test]
    fn exact_format_request_honored() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(
            &formats,
            Some(vk::Format::B8G8R8A8_SRGB),
            Some(vk::ColorSpaceKHR::SRGB_NONLINEAR),
        )
        .unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn unsupported_format_request_fails() {
        let formats = [fmt(
            vk::Format::R8G8B8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        let ret = choose_surface_format(
            &formats,
            Some(vk::Format::B8G8R8A8_SRGB),
            Some(vk::ColorSpaceKHR::SRGB_NONLINEAR),
        );
        assert_eq!(ret, Err(SquallError::FORMAT_UNSUPPORTED));
    }

    #[test]
    fn default_format_prefers_bgra_srgb() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats, None, None).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);

        // and falls back to the first entry without it
        let formats = [fmt(
            vk::Format::R8G8B8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        let chosen = choose_surface_format(&formats, None, None).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn present_mode_is_exact_match_only() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            Err(SquallError::PRESENT_MODE_UNSUPPORTED)
        );

        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            Ok(vk::PresentModeKHR::IMMEDIATE)
        );
    }

    #[test]
    fn extent_uses_fixed_or_clamped() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        let e = choose_extent(&caps, 800, 600);
        assert_eq!((e.width, e.height), (1920, 1080));

        caps.current_extent.width = std::u32::MAX;
        caps.min_image_extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let e = choose_extent(&caps, 4000, 100);
        assert_eq!((e.width, e.height), (1280, 480));
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.min_image_count = 2;
        caps.max_image_count = 0; // unbounded
        assert_eq!(desired_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(desired_image_count(&caps), 2);
    }
}
