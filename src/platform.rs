// Window system contract
//
// Squall does not create windows. The embedding application owns the
// window (or the lack of one) and hands us a VkSurfaceKHR through
// this trait. The frame loop drains its events every iteration.
//
// The one backend we do ship is VK_KHR_display, which presents
// straight to a physical output with no window system at all.
//
// Austin Shafer - 2025
use ash::extensions::khr;
use ash::vk;

use crate::device::Device;
use crate::instance::Instance;
use crate::{Result, SquallError};

/// Events squall cares about from the window system.
///
/// Anything else (input, focus) is the application's business and
/// never reaches the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    /// The user asked the application to close
    Quit,
    /// The drawable area changed, the swapchain is stale
    Resized(u32, u32),
    /// Stop rendering entirely until restored
    Minimized,
    /// Resume rendering, the swapchain is stale
    Restored,
}

/// The surface provider contract.
///
/// One of these is implemented by the windowing crate (SDL, wayland,
/// whatever) and passed into `FrameLoop::new`. Surface creation is
/// split from instance creation because VK_KHR_display needs the
/// physical device to enumerate outputs.
pub trait WindowBackend {
    /// Instance extensions this backend needs enabled.
    fn required_extensions(&self) -> Vec<*const i8>;

    /// Create the surface we will build a swapchain for.
    fn create_surface(&mut self, inst: &Instance, dev: &Device) -> Result<vk::SurfaceKHR>;

    /// Current drawable size in pixels.
    fn drawable_size(&self) -> (u32, u32);

    /// Drain any pending window events.
    fn poll_events(&mut self) -> Vec<WindowEvent>;
}

/// Present directly to a physical output using VK_KHR_display.
///
/// This has the very nice property of not requiring any window
/// system. The first connected display and its preferred mode are
/// used. There are no window events here, so the event drain is
/// always empty and the resolution never changes behind our back.
pub struct DirectDisplayBackend {
    /// Resolution of the mode we selected, filled in by create_surface
    dd_resolution: (u32, u32),
}

impl DirectDisplayBackend {
    pub fn new() -> Self {
        Self {
            dd_resolution: (0, 0),
        }
    }
}

impl WindowBackend for DirectDisplayBackend {
    fn required_extensions(&self) -> Vec<*const i8> {
        vec![
            khr::Surface::name().as_ptr(),
            khr::Display::name().as_ptr(),
        ]
    }

    fn create_surface(&mut self, inst: &Instance, dev: &Device) -> Result<vk::SurfaceKHR> {
        let d_loader = khr::Display::new(&inst.loader, &inst.inst);

        unsafe {
            // This is essentially a list of the available displays.
            // Despite having a display_name member, the names are
            // very unhelpful (e.x. "monitor").
            let disp_props = d_loader
                .get_physical_device_display_properties(dev.pdev)
                .or(Err(SquallError::SURFACE_CREATE_FAILED))?;
            if disp_props.is_empty() {
                log::error!("VK_KHR_display: no displays attached to this device");
                return Err(SquallError::SURFACE_CREATE_FAILED);
            }
            let display = disp_props[0].display;

            // The available modes for the display. This holds the
            // resolution.
            let mode_props = d_loader
                .get_display_mode_properties(dev.pdev, display)
                .or(Err(SquallError::SURFACE_CREATE_FAILED))?;
            if mode_props.is_empty() {
                return Err(SquallError::SURFACE_CREATE_FAILED);
            }
            let mode = &mode_props[0];

            // Find a plane that can scan out our chosen display
            let plane_props = d_loader
                .get_physical_device_display_plane_properties(dev.pdev)
                .or(Err(SquallError::SURFACE_CREATE_FAILED))?;
            let mut plane_index = None;
            for i in 0..plane_props.len() {
                let supported = d_loader
                    .get_display_plane_supported_displays(dev.pdev, i as u32)
                    .or(Err(SquallError::SURFACE_CREATE_FAILED))?;
                if supported.contains(&display) {
                    plane_index = Some(i as u32);
                    break;
                }
            }
            let plane_index = match plane_index {
                Some(i) => i,
                None => {
                    log::error!("VK_KHR_display: no plane supports display 0");
                    return Err(SquallError::SURFACE_CREATE_FAILED);
                }
            };

            let region = mode.parameters.visible_region;
            self.dd_resolution = (region.width, region.height);
            log::info!(
                "VK_KHR_display: presenting to display 0 at {}x{}",
                region.width,
                region.height
            );

            let info = vk::DisplaySurfaceCreateInfoKHR::builder()
                .display_mode(mode.display_mode)
                .plane_index(plane_index)
                .plane_stack_index(0)
                .transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
                .global_alpha(1.0)
                .alpha_mode(vk::DisplayPlaneAlphaFlagsKHR::OPAQUE)
                .image_extent(region);

            d_loader
                .create_display_plane_surface(&info, None)
                .or(Err(SquallError::SURFACE_CREATE_FAILED))
        }
    }

    fn drawable_size(&self) -> (u32, u32) {
        self.dd_resolution
    }

    fn poll_events(&mut self) -> Vec<WindowEvent> {
        // Physical displays do not resize or close themselves
        Vec::new()
    }
}
