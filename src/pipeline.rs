// Pipeline wrappers
//
// SPIR-V binaries are consumed as bytes from disk, we never compile
// shaders. The graphics pipeline is created with dynamic viewport
// and scissor state on purpose: it is what lets a swapchain resize
// leave every pipeline handle untouched.
//
// Austin Shafer - 2025
use ash::{util, vk};

use crate::device::Device;
use crate::{Result, SquallError};

use std::ffi::CString;
use std::io::Cursor;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use memoffset::offset_of;

/// Load a SPIR-V binary from disk into a shader module.
pub fn load_shader(dev: &Device, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            log::error!("Could not read shader {:?}: {}", path, e);
            return Err(SquallError::SHADER_LOAD_FAILED);
        }
    };

    let mut curse = Cursor::new(&bytes[..]);
    let code = util::read_spv(&mut curse).or_else(|e| {
        log::error!("Shader {:?} is not valid SPIR-V: {}", path, e);
        Err(SquallError::SHADER_LOAD_FAILED)
    })?;

    let info = vk::ShaderModuleCreateInfo::builder().code(&code);
    unsafe {
        dev.dev
            .create_shader_module(&info, None)
            .or(Err(SquallError::SHADER_LOAD_FAILED))
    }
}

/// A compute pipeline and its layout.
pub struct ComputePipeline {
    p_dev: Arc<Device>,
    p_pipeline: vk::Pipeline,
    p_layout: vk::PipelineLayout,
    p_shader: vk::ShaderModule,
}

impl ComputePipeline {
    pub fn new(
        dev: Arc<Device>,
        shader_path: &Path,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        let shader = load_shader(&dev, shader_path)?;

        // This is a really annoying issue with CString ptrs. If the
        // CString is a temporary its pointer is garbage by the time
        // the create call reads it, so it has to outlive the builder.
        let entrypoint = CString::new("main").unwrap();

        unsafe {
            let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
            let layout = match dev.dev.create_pipeline_layout(&layout_info, None) {
                Ok(l) => l,
                Err(_) => {
                    dev.dev.destroy_shader_module(shader, None);
                    return Err(SquallError::PIPELINE_CREATE_FAILED);
                }
            };

            let stage = vk::PipelineShaderStageCreateInfo {
                module: shader,
                p_name: entrypoint.as_ptr(),
                stage: vk::ShaderStageFlags::COMPUTE,
                ..Default::default()
            };

            let info = vk::ComputePipelineCreateInfo::builder()
                .stage(stage)
                .layout(layout)
                .build();

            let pipeline = match dev.dev.create_compute_pipelines(
                vk::PipelineCache::null(),
                &[info],
                None,
            ) {
                Ok(p) => p[0],
                Err(_) => {
                    dev.dev.destroy_pipeline_layout(layout, None);
                    dev.dev.destroy_shader_module(shader, None);
                    return Err(SquallError::PIPELINE_CREATE_FAILED);
                }
            };

            Ok(Self {
                p_dev: dev,
                p_pipeline: pipeline,
                p_layout: layout,
                p_shader: shader,
            })
        }
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.p_pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.p_layout
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.p_dev.dev.destroy_pipeline(self.p_pipeline, None);
            self.p_dev.dev.destroy_pipeline_layout(self.p_layout, None);
            self.p_dev.dev.destroy_shader_module(self.p_shader, None);
        }
    }
}

/// The vertex format the scene loader hands us.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// Shader push constants for the scene pass.
///
/// Must match the push_constant block in scene.vert. dynamic_draw
/// selects which slot buffer the vertex stage reads.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ScenePushConstants {
    pub view_proj: cgmath::Matrix4<f32>,
    pub dynamic_draw: u32,
    pub _pad: [u32; 3],
}

/// A graphics pipeline for the scene pass.
///
/// Viewport and scissor are dynamic state, set per frame during
/// recording. The handle is stable across swapchain recreation.
pub struct GraphicsPipeline {
    g_dev: Arc<Device>,
    g_pipeline: vk::Pipeline,
    g_layout: vk::PipelineLayout,
    g_shaders: Vec<vk::ShaderModule>,
}

impl GraphicsPipeline {
    pub fn new(
        dev: Arc<Device>,
        render_pass: vk::RenderPass,
        vert_path: &Path,
        frag_path: &Path,
        set_layouts: &[vk::DescriptorSetLayout],
        cull_back_faces: bool,
    ) -> Result<Self> {
        let vert = load_shader(&dev, vert_path)?;
        let frag = match load_shader(&dev, frag_path) {
            Ok(f) => f,
            Err(e) => {
                unsafe { dev.dev.destroy_shader_module(vert, None) };
                return Err(e);
            }
        };

        let entrypoint = CString::new("main").unwrap();
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                module: vert,
                p_name: entrypoint.as_ptr(),
                stage: vk::ShaderStageFlags::VERTEX,
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                module: frag,
                p_name: entrypoint.as_ptr(),
                stage: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            },
        ];

        let vert_bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vert_attrs = [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, normal) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 2,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, uv) as u32,
            },
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vert_bindings)
            .vertex_attribute_descriptions(&vert_attrs);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        // One viewport/scissor slot, values supplied at record time
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let raster = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(if cull_back_faces {
                vk::CullModeFlags::BACK
            } else {
                vk::CullModeFlags::NONE
            })
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_state = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::FALSE,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        }];
        let blend_state =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        unsafe {
            let push_ranges = [vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: mem::size_of::<ScenePushConstants>() as u32,
            }];
            let layout_info = vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(set_layouts)
                .push_constant_ranges(&push_ranges);
            let layout = match dev.dev.create_pipeline_layout(&layout_info, None) {
                Ok(l) => l,
                Err(_) => {
                    dev.dev.destroy_shader_module(vert, None);
                    dev.dev.destroy_shader_module(frag, None);
                    return Err(SquallError::PIPELINE_CREATE_FAILED);
                }
            };

            let info = vk::GraphicsPipelineCreateInfo::builder()
                .stages(&stages)
                .vertex_input_state(&vertex_input)
                .input_assembly_state(&input_assembly)
                .viewport_state(&viewport_state)
                .rasterization_state(&raster)
                .multisample_state(&multisample)
                .depth_stencil_state(&depth_state)
                .color_blend_state(&blend_state)
                .dynamic_state(&dynamic_state)
                .layout(layout)
                .render_pass(render_pass)
                .subpass(0)
                .build();

            let pipeline = match dev.dev.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[info],
                None,
            ) {
                Ok(p) => p[0],
                Err(_) => {
                    dev.dev.destroy_pipeline_layout(layout, None);
                    dev.dev.destroy_shader_module(vert, None);
                    dev.dev.destroy_shader_module(frag, None);
                    return Err(SquallError::PIPELINE_CREATE_FAILED);
                }
            };

            Ok(Self {
                g_dev: dev,
                g_pipeline: pipeline,
                g_layout: layout,
                g_shaders: vec![vert, frag],
            })
        }
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.g_pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.g_layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.g_dev.dev.destroy_pipeline(self.g_pipeline, None);
            self.g_dev.dev.destroy_pipeline_layout(self.g_layout, None);
            for shader in self.g_shaders.drain(..) {
                self.g_dev.dev.destroy_shader_module(shader, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_shader_expectations() {
        assert_eq!(mem::size_of::<Vertex>(), 32);
        assert_eq!(offset_of!(Vertex, pos), 0);
        assert_eq!(offset_of!(Vertex, normal), 12);
        assert_eq!(offset_of!(Vertex, uv), 24);
    }
}
