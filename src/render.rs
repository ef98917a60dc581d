// The render system
//
// Coordinates the static batch manager, the GPU culler, and the
// dynamic instance ring for one frame: publish the camera frustum,
// flush dirty statics, record the culling dispatch and its barrier,
// then issue the indirect draws for the static tier and the direct
// draws for the dynamic tier.
//
// Austin Shafer - 2025
use ash::vk;
use cgmath::{Matrix4, SquareMatrix};

use crate::batches::{DrawableFlags, InstanceTier, MeshDrawInfo, ObjectSlot, StaticBatchManager};
use crate::buffer::{GpuBuffer, RingBuffer};
use crate::config::Config;
use crate::culler::{extract_frustum_planes, GpuCuller};
use crate::device::Device;
use crate::pipeline::{GraphicsPipeline, ScenePushConstants, Vertex};
use crate::{Result, SquallError};

use std::path::Path;
use std::sync::Arc;

/// Per frame counters for the debug overlay collaborator. The
/// visible count is the previous completed frame's, reading the
/// current one would stall the pipe.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub visible_instances: u32,
    pub static_batches: u32,
    pub dynamic_instances: u32,
    pub dirty_flushed: u32,
}

struct DynamicEntry {
    slot: ObjectSlot,
    mesh: u32,
    flags: DrawableFlags,
}

pub struct RenderSystem {
    r_dev: Arc<Device>,
    r_batches: StaticBatchManager,
    r_culler: GpuCuller,
    /// Dynamic tier instance slots, one region per frame in flight
    r_dynamic_ring: RingBuffer<ObjectSlot>,
    r_dynamics: Vec<DynamicEntry>,
    r_max_dynamic: u32,

    r_static_finalized: bool,
    r_current_frame: u32,
    r_enable_gpu_culling: bool,
    /// Draw parameters per mesh id, supplied at finalize
    r_mesh_table: Vec<MeshDrawInfo>,
    /// All scene geometry in one device local vertex buffer; mesh
    /// draw infos are ranges into it
    r_vertex_buf: Option<GpuBuffer>,
    /// Camera matrix published by update_camera, pushed to the
    /// vertex stage at draw time
    r_view_proj: Matrix4<f32>,
    r_stats: FrameStats,
}

impl RenderSystem {
    /// `max_batches` is the number of distinct (mesh, material)
    /// pairs the scene can produce; the loader knows it. The culler
    /// sizes its per-batch output arrays from it.
    pub fn new(
        dev: Arc<Device>,
        config: &Config,
        cull_shader: &Path,
        max_batches: u32,
        max_dynamic: u32,
    ) -> Result<Self> {
        let culler = GpuCuller::new(
            dev.clone(),
            cull_shader,
            config.gpu.max_objects,
            max_batches,
        )?;

        let dynamic_ring = RingBuffer::new(
            dev.clone(),
            max_dynamic,
            config.swapchain.max_frames_in_flight,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;

        Ok(Self {
            r_dev: dev,
            r_batches: StaticBatchManager::new(config.gpu.max_objects),
            r_culler: culler,
            r_dynamic_ring: dynamic_ring,
            r_dynamics: Vec::new(),
            r_max_dynamic: max_dynamic,
            r_static_finalized: false,
            r_current_frame: 0,
            r_enable_gpu_culling: config.render.enable_gpu_culling,
            r_mesh_table: Vec::new(),
            r_vertex_buf: None,
            r_view_proj: Matrix4::identity(),
            r_stats: FrameStats::default(),
        })
    }

    // ---- instance registration ----

    /// Register a static or semi-static instance.
    pub fn register_static(
        &mut self,
        tier: InstanceTier,
        transform: Matrix4<f32>,
        mesh: u32,
        material: u32,
        sphere: [f32; 4],
    ) -> Result<u32> {
        if self.r_static_finalized {
            log::warn!("RenderSystem: cannot add static instances after finalization");
            return Err(SquallError::CAPACITY_EXCEEDED);
        }
        self.r_batches
            .add_instance(tier, transform, mesh, material, sphere)
    }

    pub fn update_static_transform(&mut self, id: u32, transform: Matrix4<f32>) -> Result<()> {
        self.r_batches.update_transform(id, transform)
    }

    /// Upload the static tiers and freeze registration.
    ///
    /// `mesh_table` maps mesh ids to draw parameters; each batch's
    /// indirect command gets its vertex range from here, with
    /// first_instance precomputed as the batch's slice base in the
    /// visible index buffer.
    pub fn finalize_static(&mut self, mesh_table: &[MeshDrawInfo]) -> Result<()> {
        if self.r_static_finalized {
            log::warn!("RenderSystem: static instances already finalized");
            return Ok(());
        }

        self.r_batches.upload_to_gpu(&self.r_dev)?;
        self.r_culler.upload_cull_inputs(&self.r_batches.cull_records());

        for batch in 0..self.r_batches.batch_count() {
            let key = self.r_batches.batch_key(batch).unwrap();
            let info = mesh_table
                .get(key.mesh as usize)
                .copied()
                .unwrap_or_default();
            self.r_culler
                .set_batch_draw_info(batch, info.vertex_count, info.first_vertex);
        }

        self.r_mesh_table = mesh_table.to_vec();
        self.r_static_finalized = true;
        log::info!(
            "RenderSystem: finalized {} static instances in {} batches",
            self.r_batches.instance_count(),
            self.r_batches.batch_count()
        );
        Ok(())
    }

    pub fn is_static_finalized(&self) -> bool {
        self.r_static_finalized
    }

    /// Upload the scene's vertex data, staged into device local
    /// memory. The glTF collaborator hands us flat arrays; mesh draw
    /// infos index into this buffer.
    pub fn upload_geometry(&mut self, vertices: &[Vertex]) -> Result<()> {
        if vertices.is_empty() {
            return Err(SquallError::INVALID);
        }

        let size = (vertices.len() * std::mem::size_of::<Vertex>()) as vk::DeviceSize;
        let staging = GpuBuffer::new(
            self.r_dev.clone(),
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            true,
        )?;
        staging.write(0, vertices);

        let vbuf = GpuBuffer::new(
            self.r_dev.clone(),
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )?;

        let dev = &self.r_dev;
        dev.execute_one_shot(|cmd| unsafe {
            dev.dev.cmd_copy_buffer(
                cmd,
                staging.buffer(),
                vbuf.buffer(),
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }],
            );
        })?;

        self.r_vertex_buf = Some(vbuf);
        Ok(())
    }

    // ---- frame flow ----

    pub fn begin_frame(&mut self, frame: u32) -> Result<()> {
        self.r_current_frame = frame;
        self.r_dynamics.clear();

        self.r_stats = FrameStats {
            // last completed frame's total, diagnostics only
            visible_instances: self.r_culler.readback_visible_count(),
            static_batches: self.r_batches.batch_count(),
            dynamic_instances: 0,
            dirty_flushed: 0,
        };

        if self.r_static_finalized && self.r_batches.has_dirty() {
            self.r_stats.dirty_flushed = self.r_batches.flush_dirty(&self.r_dev)?;
            // moved spheres need to reach the culler too
            self.r_culler.upload_cull_inputs(&self.r_batches.cull_records());
        }
        Ok(())
    }

    /// Extract the frustum planes from the camera and publish them.
    pub fn update_camera(&mut self, view_proj: &Matrix4<f32>) {
        self.r_view_proj = *view_proj;
        let planes = extract_frustum_planes(view_proj);
        self.r_culler.update_frustum(
            &planes,
            self.r_batches.instance_count(),
            self.r_batches.batch_count(),
        );
    }

    /// Push the camera and draw-path selector to the vertex stage.
    unsafe fn push_scene_constants(
        &self,
        cmd: vk::CommandBuffer,
        pipeline: &GraphicsPipeline,
        dynamic_draw: bool,
    ) {
        let consts = ScenePushConstants {
            view_proj: self.r_view_proj,
            dynamic_draw: dynamic_draw as u32,
            _pad: [0; 3],
        };
        self.r_dev.dev.cmd_push_constants(
            cmd,
            pipeline.layout(),
            vk::ShaderStageFlags::VERTEX,
            0,
            std::slice::from_raw_parts(
                &consts as *const _ as *const u8,
                std::mem::size_of::<ScenePushConstants>(),
            ),
        );
    }

    /// Queue a dynamic-tier instance for this frame only.
    pub fn add_dynamic(&mut self, transform: Matrix4<f32>, mesh: u32, _material: u32) -> Result<u32> {
        if self.r_dynamics.len() >= self.r_max_dynamic as usize {
            log::warn!("RenderSystem: dynamic instance capacity exceeded");
            return Err(SquallError::CAPACITY_EXCEEDED);
        }

        let index = self.r_dynamics.len() as u32;
        self.r_dynamics.push(DynamicEntry {
            slot: ObjectSlot::new(transform),
            mesh,
            flags: InstanceTier::Dynamic.flags(),
        });
        self.r_stats.dynamic_instances = self.r_dynamics.len() as u32;
        Ok(index)
    }

    /// Record the culling pass into `cmd`.
    ///
    /// With GPU culling disabled in config the reference kernel runs
    /// on the CPU and writes the same outputs; the draws cannot tell
    /// the difference.
    pub fn dispatch_culling(&mut self, cmd: vk::CommandBuffer) {
        if !self.r_static_finalized || self.r_batches.instance_count() == 0 {
            return;
        }

        if self.r_enable_gpu_culling {
            self.r_culler.reset_counters(cmd);
            self.r_culler.dispatch(cmd);
        } else {
            self.r_culler.cull_on_host(&self.r_batches.cull_records());
        }
    }

    /// Compute write -> indirect/vertex read barrier, after the
    /// dispatch and before any draw that consumes its output.
    pub fn insert_post_cull_barrier(&self, cmd: vk::CommandBuffer) {
        if self.r_enable_gpu_culling {
            self.r_culler.barrier_after_dispatch(cmd);
        }
    }

    /// Issue one indirect draw per static batch.
    ///
    /// The draw parameters live in GPU memory where the culler wrote
    /// them; nothing is read back. The pipeline's vertex stage
    /// resolves visible indices through the bound SSBOs.
    pub fn draw_static(
        &self,
        cmd: vk::CommandBuffer,
        pipeline: &GraphicsPipeline,
        desc_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        if !self.r_static_finalized || self.r_batches.instance_count() == 0 {
            return;
        }
        let vbuf = match self.r_vertex_buf.as_ref() {
            Some(b) => b.buffer(),
            // no geometry uploaded yet, nothing to draw
            None => return,
        };

        unsafe {
            self.r_dev.dev.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline(),
            );
            self.r_dev
                .dev
                .cmd_bind_vertex_buffers(cmd, 0, &[vbuf], &[0]);
            if !desc_sets.is_empty() {
                self.r_dev.dev.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout(),
                    0,
                    desc_sets,
                    dynamic_offsets,
                );
            }
            self.push_scene_constants(cmd, pipeline, false);

            for batch in 0..self.r_batches.batch_count() {
                self.r_dev.dev.cmd_draw_indirect(
                    cmd,
                    self.r_culler.indirect_buffer(),
                    self.r_culler.indirect_offset(batch),
                    1,
                    std::mem::size_of::<crate::culler::DrawIndirectCmd>() as u32,
                );
            }
        }
    }

    /// Copy this frame's dynamic entries into the ring and draw
    /// them. One draw per entry; they are few by definition, the
    /// many-instance cases live in the static tiers.
    pub fn draw_dynamic(
        &mut self,
        cmd: vk::CommandBuffer,
        pipeline: &GraphicsPipeline,
        desc_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) -> Result<u32> {
        if self.r_dynamics.is_empty() {
            return Ok(0);
        }
        let vbuf = match self.r_vertex_buf.as_ref() {
            Some(b) => b.buffer(),
            None => return Ok(0),
        };

        let slots: Vec<ObjectSlot> = self.r_dynamics.iter().map(|d| d.slot).collect();
        self.r_dynamic_ring
            .write_frame(self.r_current_frame, &slots)?;

        unsafe {
            self.r_dev.dev.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline(),
            );
            self.r_dev
                .dev
                .cmd_bind_vertex_buffers(cmd, 0, &[vbuf], &[0]);
            if !desc_sets.is_empty() {
                self.r_dev.dev.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout(),
                    0,
                    desc_sets,
                    dynamic_offsets,
                );
            }
            self.push_scene_constants(cmd, pipeline, true);

            for (i, entry) in self.r_dynamics.iter().enumerate() {
                debug_assert!(entry.flags.contains(DrawableFlags::DYNAMIC));
                let info = self
                    .r_mesh_table
                    .get(entry.mesh as usize)
                    .copied()
                    .unwrap_or_default();
                if info.vertex_count == 0 {
                    continue;
                }
                self.r_dev.dev.cmd_draw(
                    cmd,
                    info.vertex_count,
                    1,
                    info.first_vertex,
                    // the shader reads this frame's ring region at
                    // the instance index
                    i as u32,
                );
            }
        }

        Ok(self.r_dynamics.len() as u32)
    }

    /// End-of-frame hook. Nothing today; kept so the frame loop's
    /// sequence reads complete.
    pub fn end_frame(&mut self) {}

    pub fn stats(&self) -> &FrameStats {
        &self.r_stats
    }

    pub fn dynamic_ring_buffer(&self) -> vk::Buffer {
        self.r_dynamic_ring.buffer()
    }

    pub fn dynamic_frame_offset(&self, frame: u32) -> vk::DeviceSize {
        self.r_dynamic_ring.frame_offset(frame)
    }

    /// Byte size of one frame's region of the dynamic ring, for the
    /// descriptor binding range.
    pub fn dynamic_frame_size(&self) -> vk::DeviceSize {
        self.r_dynamic_ring.layout().frame_size()
    }

    pub fn visible_index_buffer(&self) -> vk::Buffer {
        self.r_culler.visible_buffer()
    }

    pub fn static_instance_buffer(&self) -> Option<vk::Buffer> {
        self.r_batches.instance_buffer()
    }

    /// Drop all registered instances and allow re-registration.
    pub fn clear(&mut self) {
        self.r_batches.clear();
        self.r_dynamics.clear();
        self.r_static_finalized = false;
    }
}
