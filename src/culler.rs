// GPU driven frustum culling
//
// A compute pass tests every registered instance's bounding sphere
// against the camera frustum and builds, per batch, a list of
// visible instance indices plus an indirect draw command. The
// graphics pipelines consume those straight from GPU memory; the
// hot path never reads anything back to the CPU.
//
// All of the culler's buffers are host visible and persistently
// mapped: the frustum and cull inputs are CPU written every frame,
// and the counters are CPU readable for diagnostics.
//
// Austin Shafer - 2025
use ash::vk;
use cgmath::{Matrix, Matrix4};

use crate::buffer::GpuBuffer;
use crate::device::Device;
use crate::pipeline::ComputePipeline;
use crate::{Result, SquallError};

use std::path::Path;
use std::sync::Arc;

/// Threads per workgroup. Must match the local_size_x declared in
/// gpu_cull.comp.
pub const WORKGROUP_SIZE: u32 = 256;

/// Per instance culling input, one contiguous record per registered
/// instance. std140 compatible, 32 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CullRecord {
    /// World space bounding sphere: xyz = center, w = radius
    pub sphere: [f32; 4],
    /// Dense index of the (mesh, material) batch. Addresses the
    /// batch's indirect draw command and visible-index slice.
    pub mesh_index: u32,
    /// Index into the material table
    pub material_index: u32,
    /// Index into the object slot SSBO
    pub instance_index: u32,
    pub _pad: u32,
}

/// The frustum uniform. std140 layout, 112 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrustumData {
    /// Six planes as (nx, ny, nz, d), normals pointing into the
    /// frustum. A sphere with signed distance <= -radius to any
    /// plane is culled.
    pub planes: [[f32; 4]; 6],
    pub object_count: u32,
    pub batch_count: u32,
    pub max_objects_per_batch: u32,
    pub _pad: u32,
}

/// Matches VkDrawIndirectCommand, 16 bytes. instance_count is GPU
/// written by the cull shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawIndirectCmd {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// Matches VkDrawIndexedIndirectCommand, 20 bytes. Used once the
/// scene moves to indexed geometry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawIndexedIndirectCmd {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Extract the six frustum planes from a view-projection matrix by
/// the Gribb/Hartmann row combinations: left/right from rows 3 +/- 0,
/// bottom/top from 3 +/- 1, near/far from 3 +/- 2. Planes are
/// normalized so the stored distance is in world units.
pub fn extract_frustum_planes(view_proj: &Matrix4<f32>) -> [[f32; 4]; 6] {
    let r0 = view_proj.row(0);
    let r1 = view_proj.row(1);
    let r2 = view_proj.row(2);
    let r3 = view_proj.row(3);

    let raw = [
        [r3.x + r0.x, r3.y + r0.y, r3.z + r0.z, r3.w + r0.w], // left
        [r3.x - r0.x, r3.y - r0.y, r3.z - r0.z, r3.w - r0.w], // right
        [r3.x + r1.x, r3.y + r1.y, r3.z + r1.z, r3.w + r1.w], // bottom
        [r3.x - r1.x, r3.y - r1.y, r3.z - r1.z, r3.w - r1.w], // top
        [r3.x + r2.x, r3.y + r2.y, r3.z + r2.z, r3.w + r2.w], // near
        [r3.x - r2.x, r3.y - r2.y, r3.z - r2.z, r3.w - r2.w], // far
    ];

    let mut planes = [[0.0; 4]; 6];
    for (i, p) in raw.iter().enumerate() {
        let len = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
        if len > 0.0 {
            planes[i] = [p[0] / len, p[1] / len, p[2] / len, p[3] / len];
        }
    }
    planes
}

/// The plane test the compute shader runs, usable host side.
pub fn sphere_visible(planes: &[[f32; 4]; 6], sphere: &[f32; 4]) -> bool {
    let radius = sphere[3];
    for p in planes.iter() {
        let dist = p[0] * sphere[0] + p[1] * sphere[1] + p[2] * sphere[2] + p[3];
        if dist <= -radius {
            return false;
        }
    }
    true
}

/// `ceil(object_count / WORKGROUP_SIZE)` workgroups per dispatch.
pub fn workgroup_count(object_count: u32) -> u32 {
    (object_count + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE
}

/// Output of the host side reference cull.
pub struct HostCullResult {
    /// Per batch visible count, capped to max_objects_per_batch
    pub batch_counters: Vec<u32>,
    /// Total visible instances actually written
    pub global: u32,
    /// Per batch visible instance indices, in input order
    pub visible: Vec<Vec<u32>>,
}

/// CPU mirror of the culling kernel.
///
/// Runs when GPU culling is disabled in config, and doubles as the
/// reference implementation for tests. The intra-batch ordering here
/// is input order; the GPU's is nondeterministic, so only the sets
/// and counts are comparable, never the order.
pub fn cull_host(
    planes: &[[f32; 4]; 6],
    records: &[CullRecord],
    batch_count: u32,
    max_per_batch: u32,
) -> HostCullResult {
    let mut counters = vec![0u32; batch_count as usize];
    let mut visible: Vec<Vec<u32>> = vec![Vec::new(); batch_count as usize];
    let mut global = 0;

    for rec in records.iter() {
        if rec.mesh_index >= batch_count {
            continue;
        }
        if !sphere_visible(planes, &rec.sphere) {
            continue;
        }

        let batch = rec.mesh_index as usize;
        let local = counters[batch];
        counters[batch] += 1;
        // Overflow clamps: the slot write is suppressed but the raw
        // counter keeps going, readback caps it below
        if local < max_per_batch {
            visible[batch].push(rec.instance_index);
            global += 1;
        }
    }

    for c in counters.iter_mut() {
        *c = (*c).min(max_per_batch);
    }

    HostCullResult {
        batch_counters: counters,
        global,
        visible,
    }
}

pub struct GpuCuller {
    c_dev: Arc<Device>,

    c_max_objects: u32,
    c_max_batches: u32,
    /// Worst case: every object lands in one batch. Sized that way
    /// on purpose, so the clamp in the shader is a safety net and
    /// not an expected path.
    c_max_objects_per_batch: u32,
    c_object_count: u32,
    c_batch_count: u32,
    c_planes: [[f32; 4]; 6],

    /// Frustum uniform, CPU written per frame
    c_frustum_buf: GpuBuffer,
    /// One CullRecord per instance, CPU written when the set changes
    c_input_buf: GpuBuffer,
    /// batches x max_objects_per_batch visible instance indices
    c_visible_buf: GpuBuffer,
    /// Single uint32 diagnostic total
    c_counter_buf: GpuBuffer,
    /// One DrawIndirectCmd per batch
    c_indirect_buf: GpuBuffer,
    /// One uint32 counter per batch
    c_batch_counter_buf: GpuBuffer,

    c_desc_layout: vk::DescriptorSetLayout,
    c_desc_pool: vk::DescriptorPool,
    c_desc: vk::DescriptorSet,

    c_pipeline: ComputePipeline,
}

impl GpuCuller {
    pub fn new(
        dev: Arc<Device>,
        shader_path: &Path,
        max_objects: u32,
        max_batches: u32,
    ) -> Result<Self> {
        if max_objects == 0 || max_batches == 0 {
            return Err(SquallError::INVALID);
        }
        let max_objects_per_batch = max_objects;

        let host_visible =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let ssbo = vk::BufferUsageFlags::STORAGE_BUFFER;

        let frustum_buf = GpuBuffer::new(
            dev.clone(),
            std::mem::size_of::<FrustumData>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            host_visible,
            true,
        )?;
        let input_buf = GpuBuffer::new(
            dev.clone(),
            max_objects as vk::DeviceSize * std::mem::size_of::<CullRecord>() as vk::DeviceSize,
            ssbo,
            host_visible,
            true,
        )?;
        let visible_size = max_batches as vk::DeviceSize
            * max_objects_per_batch as vk::DeviceSize
            * std::mem::size_of::<u32>() as vk::DeviceSize;
        let visible_buf = GpuBuffer::new(dev.clone(), visible_size, ssbo, host_visible, true)?;
        let counter_buf = GpuBuffer::new(
            dev.clone(),
            std::mem::size_of::<u32>() as vk::DeviceSize,
            ssbo | vk::BufferUsageFlags::TRANSFER_DST,
            host_visible,
            true,
        )?;
        let indirect_buf = GpuBuffer::new(
            dev.clone(),
            max_batches as vk::DeviceSize
                * std::mem::size_of::<DrawIndirectCmd>() as vk::DeviceSize,
            ssbo | vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            host_visible,
            true,
        )?;
        let batch_counter_buf = GpuBuffer::new(
            dev.clone(),
            max_batches as vk::DeviceSize * std::mem::size_of::<u32>() as vk::DeviceSize,
            ssbo | vk::BufferUsageFlags::TRANSFER_DST,
            host_visible,
            true,
        )?;

        log::info!(
            "GpuCuller: {} objects, {} batches, visible index buffer {} KiB",
            max_objects,
            max_batches,
            visible_size / 1024
        );

        // The culler's descriptor set is private and lives as long as
        // we do, so a dedicated one-set pool keeps it out of the
        // growable pool's bookkeeping
        let (layout, pool, desc) = Self::create_descriptors(
            &dev,
            &frustum_buf,
            &input_buf,
            &visible_buf,
            &counter_buf,
            &indirect_buf,
            &batch_counter_buf,
        )?;

        let pipeline = match ComputePipeline::new(dev.clone(), shader_path, &[layout]) {
            Ok(p) => p,
            Err(e) => {
                // tear down cleanly, either shader load or pipeline
                // create failed and both are fatal to the culler
                unsafe {
                    dev.dev.destroy_descriptor_pool(pool, None);
                    dev.dev.destroy_descriptor_set_layout(layout, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            c_dev: dev,
            c_max_objects: max_objects,
            c_max_batches: max_batches,
            c_max_objects_per_batch: max_objects_per_batch,
            c_object_count: 0,
            c_batch_count: 1,
            c_planes: [[0.0; 4]; 6],
            c_frustum_buf: frustum_buf,
            c_input_buf: input_buf,
            c_visible_buf: visible_buf,
            c_counter_buf: counter_buf,
            c_indirect_buf: indirect_buf,
            c_batch_counter_buf: batch_counter_buf,
            c_desc_layout: layout,
            c_desc_pool: pool,
            c_desc: desc,
            c_pipeline: pipeline,
        })
    }

    fn create_descriptors(
        dev: &Arc<Device>,
        frustum: &GpuBuffer,
        input: &GpuBuffer,
        visible: &GpuBuffer,
        counter: &GpuBuffer,
        indirect: &GpuBuffer,
        batch_counters: &GpuBuffer,
    ) -> Result<(vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet)> {
        // Bindings match gpu_cull.comp: 0 frustum UBO, 1 cull input,
        // 2 visible indices, 3 global counter, 4 indirect commands,
        // 5 per-batch counters
        let mut bindings = Vec::with_capacity(6);
        bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .descriptor_count(1)
                .build(),
        );
        for i in 1..6 {
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .descriptor_count(1)
                    .build(),
            );
        }
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe {
            dev.dev
                .create_descriptor_set_layout(&layout_info, None)
                .or(Err(SquallError::ALLOCATION_FAILED))?
        };

        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 5,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(1);
        let pool = unsafe {
            match dev.dev.create_descriptor_pool(&pool_info, None) {
                Ok(p) => p,
                Err(_) => {
                    dev.dev.destroy_descriptor_set_layout(layout, None);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            }
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let desc = unsafe {
            match dev.dev.allocate_descriptor_sets(&alloc_info) {
                Ok(d) => d[0],
                Err(_) => {
                    dev.dev.destroy_descriptor_pool(pool, None);
                    dev.dev.destroy_descriptor_set_layout(layout, None);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            }
        };

        let infos = [
            vk::DescriptorBufferInfo {
                buffer: frustum.buffer(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            vk::DescriptorBufferInfo {
                buffer: input.buffer(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            vk::DescriptorBufferInfo {
                buffer: visible.buffer(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            vk::DescriptorBufferInfo {
                buffer: counter.buffer(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            vk::DescriptorBufferInfo {
                buffer: indirect.buffer(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            vk::DescriptorBufferInfo {
                buffer: batch_counters.buffer(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
        ];

        let mut writes = Vec::with_capacity(6);
        for (i, info) in infos.iter().enumerate() {
            let ty = if i == 0 {
                vk::DescriptorType::UNIFORM_BUFFER
            } else {
                vk::DescriptorType::STORAGE_BUFFER
            };
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(desc)
                    .dst_binding(i as u32)
                    .dst_array_element(0)
                    .descriptor_type(ty)
                    .buffer_info(std::slice::from_ref(info))
                    .build(),
            );
        }
        unsafe {
            dev.dev.update_descriptor_sets(&writes, &[]);
        }

        Ok((layout, pool, desc))
    }

    pub fn max_objects_per_batch(&self) -> u32 {
        self.c_max_objects_per_batch
    }

    pub fn indirect_buffer(&self) -> vk::Buffer {
        self.c_indirect_buf.buffer()
    }

    pub fn visible_buffer(&self) -> vk::Buffer {
        self.c_visible_buf.buffer()
    }

    /// Byte offset of a batch's indirect command.
    pub fn indirect_offset(&self, batch: u32) -> vk::DeviceSize {
        batch as vk::DeviceSize * std::mem::size_of::<DrawIndirectCmd>() as vk::DeviceSize
    }

    /// Publish the frustum planes and counts into the uniform.
    pub fn update_frustum(&mut self, planes: &[[f32; 4]; 6], object_count: u32, batch_count: u32) {
        self.c_object_count = object_count.min(self.c_max_objects);
        self.c_batch_count = batch_count.min(self.c_max_batches).max(1);
        self.c_planes = *planes;

        let data = FrustumData {
            planes: *planes,
            object_count: self.c_object_count,
            batch_count: self.c_batch_count,
            max_objects_per_batch: self.c_max_objects_per_batch,
            _pad: 0,
        };
        self.c_frustum_buf.write(0, &[data]);
    }

    /// Upload the cull input records. Called when the instance set
    /// changes, not per frame.
    pub fn upload_cull_inputs(&self, records: &[CullRecord]) {
        if records.is_empty() {
            return;
        }
        let count = records.len().min(self.c_max_objects as usize);
        self.c_input_buf.write(0, &records[..count]);
    }

    /// Fill in the CPU known half of a batch's indirect command.
    /// first_instance is the batch's base offset into the visible
    /// index buffer; the shader only ever touches instance_count.
    pub fn set_batch_draw_info(&self, batch: u32, vertex_count: u32, first_vertex: u32) {
        if batch >= self.c_max_batches {
            return;
        }
        let cmd = DrawIndirectCmd {
            vertex_count,
            instance_count: 0,
            first_vertex,
            first_instance: batch * self.c_max_objects_per_batch,
        };
        self.c_indirect_buf.write(self.indirect_offset(batch), &[cmd]);
    }

    /// Zero the counters and instance counts, then make the host
    /// writes visible to the compute stage.
    pub fn reset_counters(&self, cmd: vk::CommandBuffer) {
        self.c_counter_buf.write(0, &[0u32]);

        let zeros = vec![0u32; self.c_max_batches as usize];
        self.c_batch_counter_buf.write(0, &zeros);

        // Clear instance_count in every command, preserving the draw
        // parameters, and re-derive each batch's base offset
        for batch in 0..self.c_max_batches {
            let mut cur = [DrawIndirectCmd::default()];
            self.c_indirect_buf.read(self.indirect_offset(batch), &mut cur);
            cur[0].instance_count = 0;
            cur[0].first_instance = batch * self.c_max_objects_per_batch;
            self.c_indirect_buf.write(self.indirect_offset(batch), &cur);
        }

        let barrier = [vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::HOST_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
            .build()];
        unsafe {
            self.c_dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &barrier,
                &[],
                &[],
            );
        }
    }

    /// Record the culling dispatch.
    pub fn dispatch(&self, cmd: vk::CommandBuffer) {
        if self.c_object_count == 0 {
            return;
        }

        unsafe {
            self.c_dev.dev.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.c_pipeline.pipeline(),
            );
            self.c_dev.dev.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.c_pipeline.layout(),
                0,
                &[self.c_desc],
                &[],
            );
            self.c_dev
                .dev
                .cmd_dispatch(cmd, workgroup_count(self.c_object_count), 1, 1);
        }
    }

    /// Compute writes -> indirect read + vertex shader read.
    pub fn barrier_after_dispatch(&self, cmd: vk::CommandBuffer) {
        let barrier = [vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::INDIRECT_COMMAND_READ | vk::AccessFlags::SHADER_READ,
            )
            .build()];
        unsafe {
            self.c_dev.dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::VERTEX_SHADER,
                vk::DependencyFlags::empty(),
                &barrier,
                &[],
                &[],
            );
        }
    }

    /// Run the reference cull on the CPU and write the outputs the
    /// shader would have written. Used when GPU culling is disabled.
    pub fn cull_on_host(&self, records: &[CullRecord]) {
        let result = cull_host(
            &self.c_planes,
            records,
            self.c_batch_count,
            self.c_max_objects_per_batch,
        );

        self.c_counter_buf.write(0, &[result.global]);
        self.c_batch_counter_buf.write(0, &result.batch_counters);

        for (batch, indices) in result.visible.iter().enumerate() {
            let base = batch as vk::DeviceSize
                * self.c_max_objects_per_batch as vk::DeviceSize
                * std::mem::size_of::<u32>() as vk::DeviceSize;
            self.c_visible_buf.write(base, indices);

            // instance_count at byte 4 of the batch's command
            let count = [indices.len() as u32];
            self.c_indirect_buf
                .write(self.indirect_offset(batch as u32) + 4, &count);
        }
    }

    /// Diagnostic total of visible instances from the last dispatch.
    /// Requires the frame's fence to have been waited on; never used
    /// on the draw path.
    pub fn readback_visible_count(&self) -> u32 {
        let mut count = [0u32];
        self.c_counter_buf.read(0, &mut count);
        count[0]
    }

    /// Per-batch visible counts, capped to the per-batch capacity.
    pub fn readback_batch_counters(&self) -> Vec<u32> {
        let mut counters = vec![0u32; self.c_batch_count as usize];
        self.c_batch_counter_buf.read(0, &mut counters);
        for c in counters.iter_mut() {
            *c = (*c).min(self.c_max_objects_per_batch);
        }
        counters
    }
}

impl Drop for GpuCuller {
    fn drop(&mut self) {
        unsafe {
            self.c_dev.dev.destroy_descriptor_pool(self.c_desc_pool, None);
            self.c_dev
                .dev
                .destroy_descriptor_set_layout(self.c_desc_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{perspective, Matrix4, Point3, Rad, Vector3};
    use memoffset::offset_of;

    fn camera(eye: [f32; 3], center: [f32; 3]) -> Matrix4<f32> {
        let proj = perspective(Rad(0.8f32), 800.0 / 600.0, 0.1, 100.0);
        let view = Matrix4::look_at(
            Point3::new(eye[0], eye[1], eye[2]),
            Point3::new(center[0], center[1], center[2]),
            Vector3::unit_y(),
        );
        proj * view
    }

    fn record(batch: u32, instance: u32, sphere: [f32; 4]) -> CullRecord {
        CullRecord {
            sphere,
            mesh_index: batch,
            material_index: 0,
            instance_index: instance,
            _pad: 0,
        }
    }

    #[test]
    fn gpu_layouts_are_bit_exact() {
        assert_eq!(std::mem::size_of::<CullRecord>(), 32);
        assert_eq!(offset_of!(CullRecord, sphere), 0);
        assert_eq!(offset_of!(CullRecord, mesh_index), 16);
        assert_eq!(offset_of!(CullRecord, instance_index), 24);

        assert_eq!(std::mem::size_of::<FrustumData>(), 112);
        assert_eq!(offset_of!(FrustumData, object_count), 96);

        assert_eq!(std::mem::size_of::<DrawIndirectCmd>(), 16);
        assert_eq!(std::mem::size_of::<DrawIndexedIndirectCmd>(), 20);
    }

    #[test]
    fn workgroup_counts_round_up() {
        assert_eq!(workgroup_count(1), 1);
        assert_eq!(workgroup_count(256), 1);
        assert_eq!(workgroup_count(257), 2);
        assert_eq!(workgroup_count(1024), 4);
    }

    #[test]
    fn spheres_in_view_are_counted_per_batch() {
        // camera at +z looking at the origin, four unit spheres at
        // the origin split across two batches
        let planes = extract_frustum_planes(&camera([0.0, 0.0, 10.0], [0.0, 0.0, 0.0]));
        let records = [
            record(0, 0, [0.0, 0.0, 0.0, 1.0]),
            record(1, 1, [0.0, 0.0, 0.0, 1.0]),
            record(0, 2, [0.0, 0.0, 0.0, 1.0]),
            record(1, 3, [0.0, 0.0, 0.0, 1.0]),
        ];

        let result = cull_host(&planes, &records, 2, 4096);
        assert_eq!(result.batch_counters, vec![2, 2]);
        assert_eq!(result.global, 4);
        assert_eq!(result.visible[0], vec![0, 2]);
        assert_eq!(result.visible[1], vec![1, 3]);
    }

    #[test]
    fn spheres_behind_the_camera_are_culled() {
        // same scene, camera moved far off to the side
        let planes = extract_frustum_planes(&camera([1000.0, 0.0, 0.0], [1000.0, 0.0, -1.0]));
        let records = [
            record(0, 0, [0.0, 0.0, 0.0, 1.0]),
            record(1, 1, [0.0, 0.0, 0.0, 1.0]),
            record(0, 2, [0.0, 0.0, 0.0, 1.0]),
            record(1, 3, [0.0, 0.0, 0.0, 1.0]),
        ];

        let result = cull_host(&planes, &records, 2, 4096);
        assert_eq!(result.batch_counters, vec![0, 0]);
        assert_eq!(result.global, 0);
    }

    #[test]
    fn per_batch_capacity_clamps_writes() {
        // five visible objects in one batch that only holds two
        let planes = extract_frustum_planes(&camera([0.0, 0.0, 10.0], [0.0, 0.0, 0.0]));
        let records: Vec<CullRecord> = (0..5)
            .map(|i| record(0, i, [0.0, 0.0, 0.0, 1.0]))
            .collect();

        let result = cull_host(&planes, &records, 1, 2);
        assert_eq!(result.batch_counters, vec![2]);
        assert_eq!(result.global, 2);
        assert_eq!(result.visible[0].len(), 2);

        // the two written indices are unique
        let mut indices = result.visible[0].clone();
        indices.dedup();
        assert_eq!(indices.len(), 2);
    }

    #[test]
    fn partially_clipped_spheres_survive() {
        let planes = extract_frustum_planes(&camera([0.0, 0.0, 10.0], [0.0, 0.0, 0.0]));

        // a sphere straddling the near plane is not fully outside
        let straddling = [0.0, 0.0, 9.95, 1.0];
        assert!(sphere_visible(&planes, &straddling));

        // one completely behind the camera is
        let behind = [0.0, 0.0, 20.0, 1.0];
        assert!(!sphere_visible(&planes, &behind));
    }
}
