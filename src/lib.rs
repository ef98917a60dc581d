// The Squall rendering core
//
// This is the GPU half of a Vulkan 3D engine: the frame pipeline,
// per-frame ring buffered resources, GPU driven culling, and
// descriptor management. Scene loading, config parsing, and the
// window system live in collaborator crates and talk to us through
// the contracts in `platform` and `config`.
//
// Austin Shafer - 2025
#![allow(non_camel_case_types)]

pub mod batches;
pub mod buffer;
pub mod config;
pub mod culler;
pub mod desccache;
pub mod descpool;
pub mod device;
pub mod frame;
pub mod instance;
pub mod layouts;
pub mod pipeline;
pub mod platform;
pub mod render;
pub mod swapchain;
pub mod sync;
pub mod targets;
pub mod worker;

pub use batches::{InstanceTier, ObjectSlot, StaticBatchManager};
pub use buffer::{GpuBuffer, RingBuffer};
pub use config::Config;
pub use culler::{CullRecord, GpuCuller};
pub use device::Device;
pub use frame::FrameLoop;
pub use instance::Instance;
pub use platform::{WindowBackend, WindowEvent};
pub use render::RenderSystem;
pub use worker::{ResourceWorker, WorkerCommand};

use thiserror::Error;

/// Squall specific error codes
///
/// These are the results of a rendering or initialization operation
/// failing. Recoverable swapchain states (`OUT_OF_DATE`, `SUBOPTIMAL`)
/// are enumerators here on purpose: the frame loop matches on them
/// and recreates the swapchain instead of unwinding.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum SquallError {
    #[error("No Vulkan capable devices are present")]
    NO_VULKAN_DEVICE,
    #[error("No Vulkan device satisfies the engine requirements")]
    NO_SUITABLE_DEVICE,
    #[error("The chosen device does not expose a graphics queue family")]
    GRAPHICS_QUEUE_MISSING,
    #[error("The chosen device does not support geometry shaders")]
    GEOMETRY_SHADER_UNSUPPORTED,
    #[error("Validation layers were requested but are not installed")]
    VALIDATION_LAYER_UNAVAILABLE,
    #[error("The requested surface format/color space is not supported")]
    FORMAT_UNSUPPORTED,
    #[error("The requested present mode is not supported")]
    PRESENT_MODE_UNSUPPORTED,
    #[error("Could not load a SPIR-V shader binary")]
    SHADER_LOAD_FAILED,
    #[error("Could not create a pipeline")]
    PIPELINE_CREATE_FAILED,
    #[error("The swapchain is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("The swapchain is suboptimal for the surface")]
    SUBOPTIMAL,
    #[error("The descriptor pools are exhausted and cannot grow further")]
    DESCRIPTOR_POOL_EXHAUSTED,
    #[error("A fixed capacity table is full")]
    CAPACITY_EXCEEDED,
    #[error("Could not allocate device memory")]
    ALLOCATION_FAILED,
    #[error("No device memory type satisfies the requested properties")]
    NO_SUITABLE_MEMORY_TYPE,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Could not present the swapchain image")]
    PRESENT_FAILED,
    #[error("Could not record a command buffer")]
    RECORD_FAILED,
    #[error("Could not submit work to the graphics queue")]
    SUBMIT_FAILED,
    #[error("Could not create the window surface")]
    SURFACE_CREATE_FAILED,
    #[error("Invalid parameters were passed to a squall operation")]
    INVALID,
}

pub type Result<T> = std::result::Result<T, SquallError>;
