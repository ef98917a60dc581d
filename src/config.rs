// Engine configuration
//
// The user editable config file is parsed and persisted by the
// launcher crate, we only ever see this fixed struct. Everything in
// here is validated with `clamp`, and again with
// `clamp_to_device_limits` once a physical device has been chosen,
// since the file can ask for more than the hardware has.
//
// Austin Shafer - 2025
use ash::vk;
use serde::{Deserialize, Serialize};

use crate::batches::ObjectSlot;

/// Window ranges. 8K is the ceiling we will ever negotiate for.
const MIN_WIDTH: u32 = 320;
const MAX_WIDTH: u32 = 7680;
const MIN_HEIGHT: u32 = 240;
const MAX_HEIGHT: u32 = 4320;
const MIN_IMAGE_COUNT: u32 = 2;
const MAX_IMAGE_COUNT: u32 = 8;
const MIN_FRAMES_IN_FLIGHT: u32 = 1;
const MAX_FRAMES_IN_FLIGHT: u32 = 4;
const MIN_FOV: f32 = 0.1;
const MAX_FOV: f32 = std::f32::consts::PI;
const MIN_MAX_OBJECTS: u32 = 1;
const MAX_MAX_OBJECTS: u32 = 10_000_000;
const MIN_DESC_COUNT: u32 = 1;
const MAX_DESC_COUNT: u32 = 100_000;

/// Surface formats we know how to name in the config file.
static FORMAT_NAMES: &[(&str, vk::Format)] = &[
    ("B8G8R8A8_SRGB", vk::Format::B8G8R8A8_SRGB),
    ("B8G8R8A8_UNORM", vk::Format::B8G8R8A8_UNORM),
    ("R8G8B8A8_SRGB", vk::Format::R8G8B8A8_SRGB),
    ("R8G8B8A8_UNORM", vk::Format::R8G8B8A8_UNORM),
    ("A2B10G10R10_UNORM_PACK32", vk::Format::A2B10G10R10_UNORM_PACK32),
    ("R16G16B16A16_SFLOAT", vk::Format::R16G16B16A16_SFLOAT),
];

static COLOR_SPACE_NAMES: &[(&str, vk::ColorSpaceKHR)] = &[
    ("SRGB_NONLINEAR", vk::ColorSpaceKHR::SRGB_NONLINEAR),
    ("EXTENDED_SRGB_LINEAR", vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
    ("HDR10_ST2084", vk::ColorSpaceKHR::HDR10_ST2084_EXT),
];

static PRESENT_MODE_NAMES: &[(&str, vk::PresentModeKHR)] = &[
    ("fifo", vk::PresentModeKHR::FIFO),
    ("mailbox", vk::PresentModeKHR::MAILBOX),
    ("immediate", vk::PresentModeKHR::IMMEDIATE),
    ("fifo-relaxed", vk::PresentModeKHR::FIFO_RELAXED),
];

pub fn format_from_str(s: &str) -> Option<vk::Format> {
    FORMAT_NAMES.iter().find(|(n, _)| *n == s).map(|(_, f)| *f)
}

pub fn format_to_str(f: vk::Format) -> String {
    match FORMAT_NAMES.iter().find(|(_, v)| *v == f) {
        Some((n, _)) => (*n).to_owned(),
        None => format!("{:?}", f),
    }
}

pub fn color_space_from_str(s: &str) -> Option<vk::ColorSpaceKHR> {
    COLOR_SPACE_NAMES.iter().find(|(n, _)| *n == s).map(|(_, c)| *c)
}

pub fn color_space_to_str(c: vk::ColorSpaceKHR) -> String {
    match COLOR_SPACE_NAMES.iter().find(|(_, v)| *v == c) {
        Some((n, _)) => (*n).to_owned(),
        None => format!("{:?}", c),
    }
}

pub fn present_mode_from_str(s: &str) -> Option<vk::PresentModeKHR> {
    PRESENT_MODE_NAMES.iter().find(|(n, _)| *n == s).map(|(_, m)| *m)
}

pub fn present_mode_to_str(m: vk::PresentModeKHR) -> String {
    match PRESENT_MODE_NAMES.iter().find(|(_, v)| *v == m) {
        Some((n, _)) => (*n).to_owned(),
        None => format!("{:?}", m),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapchainConfig {
    /// Requested image count (2 = double, 3 = triple buffering). The
    /// driver negotiates the final count, see `Swapchain`.
    pub image_count: u32,
    pub max_frames_in_flight: u32,
    /// "fifo" | "mailbox" | "immediate" | "fifo-relaxed". Exact match
    /// only, an unsupported mode is a hard failure.
    pub present_mode: String,
    /// Preferred surface format name. Empty = driver default.
    pub preferred_format: String,
    /// Preferred color space name. Empty = driver default.
    pub preferred_color_space: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    Perspective,
    Orthographic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub projection: Projection,
    pub fov_y_rad: f32,
    pub near_z: f32,
    pub far_z: f32,
    pub ortho_half_extent: f32,
    pub ortho_near: f32,
    pub ortho_far: f32,
    pub pan_speed: f32,
    pub initial_position: [f32; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    pub cull_back_faces: bool,
    pub clear_color: [f32; 4],
    pub enable_gpu_culling: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorCacheConfig {
    pub max_sets: u32,
    pub uniform_buffers: u32,
    pub samplers: u32,
    pub storage_buffers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuConfig {
    /// Upper bound on registered instances. Storage cost is
    /// `max_objects * 256` bytes per object SSBO.
    pub max_objects: u32,
    pub descriptor_cache: DescriptorCacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    pub show_light_debug: bool,
}

/// The full engine configuration
///
/// Out of range values are clamped, not rejected, so a hand edited
/// file degrades gracefully. Only the swapchain format/present-mode
/// requests can hard-fail, and that happens at swapchain creation
/// with the supported alternatives logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub window: WindowConfig,
    pub swapchain: SwapchainConfig,
    pub camera: CameraConfig,
    pub render: RenderConfig,
    pub gpu: GpuConfig,
    pub debug: DebugConfig,
    /// Enable the VK_LAYER_KHRONOS_validation layer. Not persisted by
    /// the launcher, set from the build type or environment.
    #[serde(skip)]
    pub validation_layers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: WindowConfig {
                width: 800,
                height: 600,
                fullscreen: false,
                title: "Squall".to_owned(),
            },
            swapchain: SwapchainConfig {
                image_count: 3,
                max_frames_in_flight: 2,
                present_mode: "fifo".to_owned(),
                preferred_format: "B8G8R8A8_SRGB".to_owned(),
                preferred_color_space: "SRGB_NONLINEAR".to_owned(),
            },
            camera: CameraConfig {
                projection: Projection::Perspective,
                fov_y_rad: 0.8,
                near_z: 0.1,
                far_z: 100.0,
                ortho_half_extent: 8.0,
                ortho_near: -10.0,
                ortho_far: 10.0,
                pan_speed: 8.0,
                initial_position: [0.0, 0.0, 8.0],
            },
            render: RenderConfig {
                cull_back_faces: false,
                clear_color: [0.1, 0.1, 0.4, 1.0],
                enable_gpu_culling: true,
            },
            gpu: GpuConfig {
                max_objects: 4096,
                descriptor_cache: DescriptorCacheConfig {
                    max_sets: 1000,
                    uniform_buffers: 500,
                    samplers: 500,
                    storage_buffers: 100,
                },
            },
            debug: DebugConfig {
                show_light_debug: false,
            },
            validation_layers: cfg!(debug_assertions),
        }
    }
}

fn clamp_u32(val: &mut u32, min: u32, max: u32, name: &str) {
    if *val < min || *val > max {
        let new = (*val).max(min).min(max);
        log::warn!(
            "Config '{}': {} out of range [{}, {}], clamped to {}",
            name,
            *val,
            min,
            max,
            new
        );
        *val = new;
    }
}

fn clamp_f32(val: &mut f32, min: f32, max: f32, name: &str) {
    if *val < min || *val > max {
        let new = (*val).max(min).min(max);
        log::warn!(
            "Config '{}': {} out of range [{}, {}], clamped to {}",
            name,
            *val,
            min,
            max,
            new
        );
        *val = new;
    }
}

impl Config {
    /// Validate the user supplied values against our static ranges.
    ///
    /// Called once after the launcher hands us the struct. Anything
    /// out of range is clamped and logged.
    pub fn clamp(&mut self) {
        clamp_u32(&mut self.window.width, MIN_WIDTH, MAX_WIDTH, "window.width");
        clamp_u32(
            &mut self.window.height,
            MIN_HEIGHT,
            MAX_HEIGHT,
            "window.height",
        );

        clamp_u32(
            &mut self.swapchain.image_count,
            MIN_IMAGE_COUNT,
            MAX_IMAGE_COUNT,
            "swapchain.image_count",
        );
        clamp_u32(
            &mut self.swapchain.max_frames_in_flight,
            MIN_FRAMES_IN_FLIGHT,
            MAX_FRAMES_IN_FLIGHT,
            "swapchain.max_frames_in_flight",
        );

        // A far plane in front of the near plane is always a mistake,
        // swap them back instead of clamping into nonsense.
        if self.camera.near_z > self.camera.far_z {
            log::warn!(
                "Config 'camera': near_z {} > far_z {}, swapping",
                self.camera.near_z,
                self.camera.far_z
            );
            std::mem::swap(&mut self.camera.near_z, &mut self.camera.far_z);
        }
        if self.camera.ortho_near > self.camera.ortho_far {
            log::warn!(
                "Config 'camera': ortho_near {} > ortho_far {}, swapping",
                self.camera.ortho_near,
                self.camera.ortho_far
            );
            std::mem::swap(&mut self.camera.ortho_near, &mut self.camera.ortho_far);
        }
        clamp_f32(
            &mut self.camera.fov_y_rad,
            MIN_FOV,
            MAX_FOV,
            "camera.fov_y_rad",
        );
        clamp_f32(
            &mut self.camera.ortho_half_extent,
            0.001,
            10000.0,
            "camera.ortho_half_extent",
        );

        for (i, c) in self.render.clear_color.iter_mut().enumerate() {
            let name = ["render.clear_color.r", "render.clear_color.g",
                        "render.clear_color.b", "render.clear_color.a"][i];
            clamp_f32(c, 0.0, 1.0, name);
        }

        clamp_u32(
            &mut self.gpu.max_objects,
            MIN_MAX_OBJECTS,
            MAX_MAX_OBJECTS,
            "gpu.max_objects",
        );
        let dc = &mut self.gpu.descriptor_cache;
        clamp_u32(&mut dc.max_sets, MIN_DESC_COUNT, MAX_DESC_COUNT, "gpu.descriptor_cache.max_sets");
        clamp_u32(
            &mut dc.uniform_buffers,
            MIN_DESC_COUNT,
            MAX_DESC_COUNT,
            "gpu.descriptor_cache.uniform_buffers",
        );
        clamp_u32(&mut dc.samplers, MIN_DESC_COUNT, MAX_DESC_COUNT, "gpu.descriptor_cache.samplers");
        clamp_u32(
            &mut dc.storage_buffers,
            MIN_DESC_COUNT,
            MAX_DESC_COUNT,
            "gpu.descriptor_cache.storage_buffers",
        );
    }

    /// Re-validate against the limits of the device we actually got.
    ///
    /// The static ranges above allow anything a plausible GPU could
    /// do. The device we end up on may be far smaller, so the object
    /// table and descriptor counts get a second clamp here. Called
    /// after device selection and again after swapchain recreation.
    pub fn clamp_to_device_limits(&mut self, limits: &vk::PhysicalDeviceLimits) {
        let slot_size = std::mem::size_of::<ObjectSlot>() as u64;
        let required = self.gpu.max_objects as u64 * slot_size;
        if required > limits.max_storage_buffer_range as u64 {
            let max_allowed = (limits.max_storage_buffer_range as u64 / slot_size) as u32;
            log::warn!(
                "gpu.max_objects {} needs {} bytes, exceeds maxStorageBufferRange {}, clamping to {}",
                self.gpu.max_objects,
                required,
                limits.max_storage_buffer_range,
                max_allowed
            );
            self.gpu.max_objects = max_allowed.max(1);
        }

        let dc = &mut self.gpu.descriptor_cache;
        if dc.uniform_buffers > limits.max_descriptor_set_uniform_buffers {
            log::warn!(
                "gpu.descriptor_cache.uniform_buffers {} > device limit {}, clamping",
                dc.uniform_buffers,
                limits.max_descriptor_set_uniform_buffers
            );
            dc.uniform_buffers = limits.max_descriptor_set_uniform_buffers;
        }
        if dc.samplers > limits.max_descriptor_set_samplers {
            log::warn!(
                "gpu.descriptor_cache.samplers {} > device limit {}, clamping",
                dc.samplers,
                limits.max_descriptor_set_samplers
            );
            dc.samplers = limits.max_descriptor_set_samplers;
        }
        if dc.storage_buffers > limits.max_descriptor_set_storage_buffers {
            log::warn!(
                "gpu.descriptor_cache.storage_buffers {} > device limit {}, clamping",
                dc.storage_buffers,
                limits.max_descriptor_set_storage_buffers
            );
            dc.storage_buffers = limits.max_descriptor_set_storage_buffers;
        }
    }

    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        present_mode_from_str(&self.swapchain.present_mode)
    }

    pub fn preferred_format(&self) -> Option<vk::Format> {
        if self.swapchain.preferred_format.is_empty() {
            return None;
        }
        format_from_str(&self.swapchain.preferred_format)
    }

    pub fn preferred_color_space(&self) -> Option<vk::ColorSpaceKHR> {
        if self.swapchain.preferred_color_space.is_empty() {
            return None;
        }
        color_space_from_str(&self.swapchain.preferred_color_space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_window_dimensions() {
        let mut config = Config::default();
        config.window.width = 16;
        config.window.height = 100_000;
        config.clamp();
        assert_eq!(config.window.width, 320);
        assert_eq!(config.window.height, 4320);
    }

    #[test]
    fn clamps_swapchain_counts() {
        let mut config = Config::default();
        config.swapchain.image_count = 1;
        config.swapchain.max_frames_in_flight = 9;
        config.clamp();
        assert_eq!(config.swapchain.image_count, 2);
        assert_eq!(config.swapchain.max_frames_in_flight, 4);
    }

    #[test]
    fn swaps_inverted_depth_planes() {
        let mut config = Config::default();
        config.camera.near_z = 50.0;
        config.camera.far_z = 0.5;
        config.clamp();
        assert_eq!(config.camera.near_z, 0.5);
        assert_eq!(config.camera.far_z, 50.0);
    }

    #[test]
    fn clamps_object_count_to_storage_range() {
        let mut config = Config::default();
        config.gpu.max_objects = 1_000_000;

        // A small device: 1 MiB storage range fits 4096 object slots
        let mut limits = vk::PhysicalDeviceLimits::default();
        limits.max_storage_buffer_range = 1 << 20;
        limits.max_descriptor_set_uniform_buffers = 64;
        limits.max_descriptor_set_samplers = 1024;
        limits.max_descriptor_set_storage_buffers = 1024;

        config.clamp_to_device_limits(&limits);
        assert_eq!(config.gpu.max_objects, 4096);
        assert_eq!(config.gpu.descriptor_cache.uniform_buffers, 64);
    }

    #[test]
    fn name_tables_round_trip() {
        assert_eq!(
            present_mode_from_str("immediate"),
            Some(vk::PresentModeKHR::IMMEDIATE)
        );
        assert_eq!(present_mode_from_str("vsync"), None);
        assert_eq!(
            format_from_str("B8G8R8A8_SRGB"),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert_eq!(format_to_str(vk::Format::B8G8R8A8_SRGB), "B8G8R8A8_SRGB");
        assert_eq!(
            color_space_from_str("SRGB_NONLINEAR"),
            Some(vk::ColorSpaceKHR::SRGB_NONLINEAR)
        );
    }
}
