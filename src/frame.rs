// The frame loop
//
// Owns the whole per-frame machine: sync set, swapchain, render
// targets, command buffers, and the render system. One iteration is
// wait fence -> acquire -> record (cull compute, barrier, scene
// pass) -> submit -> present, with resize recovery folded in.
//
// Submission waits on image_available[current_frame] and signals
// render_finished[acquired_image]; presentation waits on that same
// per-image semaphore. The in-flight fence is what keeps CPU writes
// to frame N's ring region from racing the GPU.
//
// Austin Shafer - 2025
use ash::vk;

use crate::config::Config;
use crate::desccache::{self, TextureDescCache};
use crate::descpool::DescPool;
use crate::device::Device;
use crate::instance::Instance;
use crate::layouts::LayoutRegistry;
use crate::batches::MeshDrawInfo;
use crate::pipeline::GraphicsPipeline;
use crate::platform::{WindowBackend, WindowEvent};
use crate::render::RenderSystem;
use crate::swapchain::Swapchain;
use crate::sync::SyncSet;
use crate::targets::RenderTargets;
use crate::worker::ResourceWorker;
use crate::{Result, SquallError};

use std::path::PathBuf;
use std::sync::Arc;

/// Layout key for the static scene set: object slots + visible
/// index list, both read by the vertex stage.
pub const SCENE_STATIC_KEY: &str = "scene_static";
/// Layout key for the dynamic ring set. The single binding is a
/// dynamic storage buffer so one set serves every frame region.
pub const SCENE_DYNAMIC_KEY: &str = "scene_dynamic";

/// Where our SPIR-V lives on disk.
pub struct ShaderPaths {
    pub cull: PathBuf,
    pub vert: PathBuf,
    pub frag: PathBuf,
}

type RecordHook = Box<dyn FnMut(vk::CommandBuffer)>;
type UpdateHook = Box<dyn FnMut(&mut RenderSystem)>;

pub struct FrameLoop {
    f_config: Config,
    f_backend: Box<dyn WindowBackend>,

    // Declaration order doubles as teardown order: everything below
    // holds an Arc to the device, which drops last on its own.
    f_worker: ResourceWorker,
    f_desccache: TextureDescCache,
    f_descpool: DescPool,
    f_registry: LayoutRegistry,
    f_render: RenderSystem,
    f_pipeline: GraphicsPipeline,
    f_targets: RenderTargets,
    f_sync: SyncSet,
    f_swapchain: Swapchain,
    f_dev: Arc<Device>,

    f_cmd_pool: vk::CommandPool,
    f_cbufs: Vec<vk::CommandBuffer>,

    /// Scene sets, allocated by finalize_scene
    f_static_set: vk::DescriptorSet,
    f_dynamic_set: vk::DescriptorSet,

    /// Offscreen passes recorded before the scene pass
    f_pre_scene: Option<RecordHook>,
    /// Debug geometry recorded inside the scene pass, after draws
    f_post_scene: Option<RecordHook>,
    /// Application scene update, runs between begin_frame and record
    f_update: Option<UpdateHook>,

    f_swapchain_dirty: bool,
    f_minimized: bool,
    f_quit: bool,
}

impl FrameLoop {
    pub fn new(
        mut config: Config,
        mut backend: Box<dyn WindowBackend>,
        shaders: &ShaderPaths,
        max_batches: u32,
        max_dynamic: u32,
    ) -> Result<Self> {
        config.clamp();

        let instance = Arc::new(Instance::new(&config, backend.as_ref())?);
        let dev = Device::new(instance.clone())?;
        config.clamp_to_device_limits(dev.limits());

        let surface = backend.create_surface(&instance, &dev)?;
        let swapchain = Swapchain::new(dev.clone(), surface, &config)?;
        let targets = RenderTargets::new(
            dev.clone(),
            swapchain.format(),
            swapchain.extent(),
            swapchain.views(),
        )?;
        let sync = SyncSet::new(
            dev.clone(),
            config.swapchain.max_frames_in_flight,
            swapchain.image_count(),
        )?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(dev.graphics_family);
        let cmd_pool = unsafe {
            dev.dev
                .create_command_pool(&pool_info, None)
                .or(Err(SquallError::ALLOCATION_FAILED))?
        };
        let cbufs = Self::allocate_cbufs(&dev, cmd_pool, swapchain.image_count())?;

        // Layouts and the growable pool behind them
        let mut registry = LayoutRegistry::new(dev.clone());
        Self::register_scene_layouts(&mut registry)?;
        desccache::register_textured_mat_layout(&mut registry)?;

        let ceiling = dev
            .limits()
            .max_descriptor_set_uniform_buffers
            .max(config.gpu.descriptor_cache.max_sets);
        let mut descpool = DescPool::new(dev.clone(), ceiling);
        let keys: Vec<String> = vec![
            SCENE_STATIC_KEY.to_owned(),
            SCENE_DYNAMIC_KEY.to_owned(),
            desccache::TEXTURED_MAT_KEY.to_owned(),
        ];
        descpool.build_pool(&registry, &keys, config.gpu.descriptor_cache.max_sets)?;

        let render = RenderSystem::new(dev.clone(), &config, &shaders.cull, max_batches, max_dynamic)?;

        let set_layouts = [
            registry.get(SCENE_STATIC_KEY).unwrap(),
            registry.get(SCENE_DYNAMIC_KEY).unwrap(),
        ];
        let pipeline = GraphicsPipeline::new(
            dev.clone(),
            targets.render_pass(),
            &shaders.vert,
            &shaders.frag,
            &set_layouts,
            config.render.cull_back_faces,
        )?;

        Ok(Self {
            f_config: config,
            f_backend: backend,
            f_worker: ResourceWorker::start(),
            f_desccache: TextureDescCache::new(dev.clone()),
            f_descpool: descpool,
            f_registry: registry,
            f_render: render,
            f_pipeline: pipeline,
            f_targets: targets,
            f_sync: sync,
            f_swapchain: swapchain,
            f_dev: dev,
            f_cmd_pool: cmd_pool,
            f_cbufs: cbufs,
            f_static_set: vk::DescriptorSet::null(),
            f_dynamic_set: vk::DescriptorSet::null(),
            f_pre_scene: None,
            f_post_scene: None,
            f_update: None,
            f_swapchain_dirty: false,
            f_minimized: false,
            f_quit: false,
        })
    }

    fn register_scene_layouts(registry: &mut LayoutRegistry) -> Result<()> {
        let static_bindings = [
            // object slots
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .descriptor_count(1)
                .build(),
            // visible instance indices
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .descriptor_count(1)
                .build(),
        ];
        registry.register(SCENE_STATIC_KEY, &static_bindings)?;

        let dynamic_bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .descriptor_count(1)
            .build()];
        registry.register(SCENE_DYNAMIC_KEY, &dynamic_bindings)?;
        Ok(())
    }

    fn allocate_cbufs(
        dev: &Arc<Device>,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe {
            dev.dev
                .allocate_command_buffers(&info)
                .or(Err(SquallError::ALLOCATION_FAILED))
        }
    }

    pub fn render_system(&mut self) -> &mut RenderSystem {
        &mut self.f_render
    }

    pub fn worker(&self) -> &ResourceWorker {
        &self.f_worker
    }

    pub fn config(&self) -> &Config {
        &self.f_config
    }

    /// Swap in a new configuration, as when the user edits settings
    /// at runtime. Swapchain-affecting changes (present mode, format,
    /// size) take effect through a recreate on the next iteration.
    pub fn apply_config(&mut self, mut config: Config) {
        config.clamp();
        config.clamp_to_device_limits(self.f_dev.limits());
        self.f_config = config;
        self.f_swapchain_dirty = true;
    }

    /// Register a texture's descriptor set through the cache.
    pub fn texture_descriptor(
        &mut self,
        texture: &Arc<desccache::Texture>,
    ) -> Result<vk::DescriptorSet> {
        let object_buf = self
            .f_render
            .static_instance_buffer()
            .unwrap_or_else(|| self.f_render.dynamic_ring_buffer());
        self.f_desccache
            .get_or_create(&mut self.f_descpool, &self.f_registry, texture, object_buf)
    }

    /// Evict descriptor sets for textures the scene dropped.
    pub fn trim_textures(&mut self, referenced: &std::collections::HashSet<u32>) -> usize {
        self.f_desccache
            .cleanup_unused(&mut self.f_descpool, referenced)
    }

    pub fn set_pre_scene_hook(&mut self, hook: RecordHook) {
        self.f_pre_scene = Some(hook);
    }

    pub fn set_post_scene_hook(&mut self, hook: RecordHook) {
        self.f_post_scene = Some(hook);
    }

    pub fn set_update_hook(&mut self, hook: UpdateHook) {
        self.f_update = Some(hook);
    }

    /// Upload the static scene and wire the scene descriptor sets.
    /// Call once after registering instances, before `run`.
    pub fn finalize_scene(&mut self, mesh_table: &[MeshDrawInfo]) -> Result<()> {
        self.f_render.finalize_static(mesh_table)?;

        self.f_static_set = self.f_descpool.allocate(&self.f_registry, SCENE_STATIC_KEY)?;
        self.f_dynamic_set = self
            .f_descpool
            .allocate(&self.f_registry, SCENE_DYNAMIC_KEY)?;

        // An empty static scene has no slot buffer; bind the ring in
        // its place since a null buffer is invalid in a descriptor.
        // Nothing reads it, draw_static early-outs on zero instances.
        let slots_buf = self
            .f_render
            .static_instance_buffer()
            .unwrap_or_else(|| self.f_render.dynamic_ring_buffer());

        let slot_info = [vk::DescriptorBufferInfo::builder()
            .buffer(slots_buf)
            .offset(0)
            .range(vk::WHOLE_SIZE)
            .build()];
        let visible_info = [vk::DescriptorBufferInfo::builder()
            .buffer(self.f_render.visible_index_buffer())
            .offset(0)
            .range(vk::WHOLE_SIZE)
            .build()];
        let ring_info = [vk::DescriptorBufferInfo::builder()
            .buffer(self.f_render.dynamic_ring_buffer())
            .offset(0)
            .range(self.f_render.dynamic_frame_size())
            .build()];

        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(self.f_static_set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&slot_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.f_static_set)
                .dst_binding(1)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&visible_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.f_dynamic_set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC)
                .buffer_info(&ring_info)
                .build(),
        ];
        unsafe {
            self.f_dev.dev.update_descriptor_sets(&writes, &[]);
        }
        Ok(())
    }

    /// Run until the window closes or a fatal error surfaces.
    pub fn run(&mut self) -> Result<()> {
        while !self.f_quit {
            for event in self.f_backend.poll_events() {
                match event {
                    WindowEvent::Quit => self.f_quit = true,
                    WindowEvent::Resized(_, _) => self.f_swapchain_dirty = true,
                    WindowEvent::Minimized => self.f_minimized = true,
                    WindowEvent::Restored => {
                        self.f_minimized = false;
                        self.f_swapchain_dirty = true;
                    }
                }
            }
            if self.f_quit {
                break;
            }
            if self.f_minimized {
                // nothing to present, don't spin
                std::thread::sleep(std::time::Duration::from_millis(10));
                continue;
            }
            if self.f_swapchain_dirty {
                self.recreate_swapchain()?;
                self.f_swapchain_dirty = false;
                continue;
            }

            match self.draw_frame() {
                Ok(suboptimal) => {
                    if suboptimal {
                        self.f_swapchain_dirty = true;
                    }
                }
                // recoverable: recreate on the next iteration
                Err(SquallError::OUT_OF_DATE) | Err(SquallError::SUBOPTIMAL) => {
                    self.f_swapchain_dirty = true;
                }
                Err(e) => return Err(e),
            }
        }

        self.f_dev.wait_idle();
        self.f_worker.stop();
        Ok(())
    }

    /// One full frame. Returns whether the swapchain reported
    /// suboptimal anywhere along the way.
    fn draw_frame(&mut self) -> Result<bool> {
        let frame = self.f_sync.current_frame();

        unsafe {
            self.f_dev
                .dev
                .wait_for_fences(&[self.f_sync.in_flight_fence(frame)], true, std::u64::MAX)
                .or(Err(SquallError::SUBMIT_FAILED))?;
        }

        let (image_index, acquire_suboptimal) =
            match self.f_swapchain.acquire(self.f_sync.image_available(frame)) {
                Ok(ret) => ret,
                Err(e) => {
                    // the image-available semaphore was not consumed,
                    // rotating to the next slot keeps it unsignaled
                    self.f_sync.advance_frame();
                    return Err(e);
                }
            };

        // Only reset once we know we will submit, otherwise the next
        // wait would deadlock on a fence nothing signals
        unsafe {
            self.f_dev
                .dev
                .reset_fences(&[self.f_sync.in_flight_fence(frame)])
                .or(Err(SquallError::SUBMIT_FAILED))?;
        }

        self.f_render.begin_frame(frame)?;
        if let Some(update) = self.f_update.as_mut() {
            update(&mut self.f_render);
        }

        self.record_commands(frame, image_index)?;
        self.submit(frame, image_index)?;

        let present_result = self.f_swapchain.present(
            self.f_dev.graphics_queue,
            image_index,
            // keyed by the acquired image, not the frame slot
            self.f_sync.render_finished_for_image(image_index),
        );

        self.f_render.end_frame();
        self.f_sync.advance_frame();

        let present_suboptimal = present_result?;
        Ok(acquire_suboptimal || present_suboptimal)
    }

    fn record_commands(&mut self, frame: u32, image_index: u32) -> Result<()> {
        let cmd = self.f_cbufs[image_index as usize];
        let dev = &self.f_dev.dev;

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder();
            dev.begin_command_buffer(cmd, &begin_info)
                .or(Err(SquallError::RECORD_FAILED))?;

            // Offscreen work (shadow maps, PIP viewports) goes first
            if let Some(hook) = self.f_pre_scene.as_mut() {
                hook(cmd);
            }

            // Culling happens outside the render pass: compute
            // dispatches are not allowed inside one
            self.f_render.dispatch_culling(cmd);
            self.f_render.insert_post_cull_barrier(cmd);

            let cc = self.f_config.render.clear_color;
            let clear_values = [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [cc[0], cc[1], cc[2], cc[3]],
                    },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            ];
            let extent = self.f_swapchain.extent();
            let pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.f_targets.render_pass())
                .framebuffer(self.f_targets.framebuffer(image_index))
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear_values);
            dev.cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);

            dev.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            dev.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );

            // Both paths bind the same set pair; the dynamic binding
            // in set 1 always needs its frame offset supplied
            let sets = [self.f_static_set, self.f_dynamic_set];
            let ring_offset = [self.f_render.dynamic_frame_offset(frame) as u32];
            self.f_render
                .draw_static(cmd, &self.f_pipeline, &sets, &ring_offset);
            self.f_render
                .draw_dynamic(cmd, &self.f_pipeline, &sets, &ring_offset)?;

            // Debug lines draw on top, still inside the pass
            if let Some(hook) = self.f_post_scene.as_mut() {
                hook(cmd);
            }

            dev.cmd_end_render_pass(cmd);
            dev.end_command_buffer(cmd)
                .or(Err(SquallError::RECORD_FAILED))?;
        }
        Ok(())
    }

    fn submit(&mut self, frame: u32, image_index: u32) -> Result<()> {
        let wait_semas = [self.f_sync.image_available(frame)];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cbufs = [self.f_cbufs[image_index as usize]];
        let signal_semas = [self.f_sync.render_finished_for_image(image_index)];

        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&signal_semas)
            .build();

        unsafe {
            self.f_dev
                .dev
                .queue_submit(
                    self.f_dev.graphics_queue,
                    &[submit],
                    self.f_sync.in_flight_fence(frame),
                )
                .or(Err(SquallError::SUBMIT_FAILED))
        }
    }

    /// Tear down and rebuild everything the swapchain size touches.
    fn recreate_swapchain(&mut self) -> Result<()> {
        let (width, height) = self.f_backend.drawable_size();
        if width == 0 || height == 0 {
            // still minimized, try again next iteration
            self.f_minimized = true;
            return Ok(());
        }

        self.f_dev.wait_idle();

        self.f_swapchain.recreate(&self.f_config, width, height)?;
        self.f_targets
            .rebuild(self.f_swapchain.extent(), self.f_swapchain.views())?;

        // Image count can change across recreation; the per-image
        // semaphores and command buffers follow it
        let image_count = self.f_swapchain.image_count();
        self.f_sync.resize_image_count(image_count)?;
        if self.f_cbufs.len() != image_count as usize {
            unsafe {
                self.f_dev
                    .dev
                    .free_command_buffers(self.f_cmd_pool, &self.f_cbufs);
            }
            self.f_cbufs = Self::allocate_cbufs(&self.f_dev, self.f_cmd_pool, image_count)?;
        }

        // The device did not change but its limits still bound what
        // the config may ask for on the rebuilt resources
        self.f_config.clamp_to_device_limits(self.f_dev.limits());

        log::info!(
            "Recreated swapchain at {}x{} with {} images",
            width,
            height,
            image_count
        );
        Ok(())
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.f_dev.wait_idle();
        unsafe {
            self.f_dev
                .dev
                .free_command_buffers(self.f_cmd_pool, &self.f_cbufs);
            self.f_dev.dev.destroy_command_pool(self.f_cmd_pool, None);
        }
        // Members drop in declaration order after this: worker,
        // descriptor state, render system, pipeline, targets, sync,
        // swapchain, and finally the device Arc.
    }
}
