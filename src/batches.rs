// Multi-tier instance batching
//
// Instances are classified by update cadence:
//   Static     - never moves after load (terrain, buildings)
//   SemiStatic - moves sporadically, tracked by dirty flag
//   Dynamic    - rewritten every frame through the dynamic ring
//   Procedural - generated by compute, never CPU resident
//
// The StaticBatchManager owns the first two tiers: a CPU table of
// instance entries grouped into (mesh, material) batches, mirrored
// into two device local SSBOs (object slots and cull records) by a
// staged upload. Transform edits only touch the dirty slots on the
// next flush.
//
// Austin Shafer - 2025
use ash::vk;
use cgmath::{Matrix4, SquareMatrix};

use crate::buffer::GpuBuffer;
use crate::culler::CullRecord;
use crate::device::Device;
use crate::{Result, SquallError};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceTier {
    Static,
    SemiStatic,
    Dynamic,
    Procedural,
}

bitflags::bitflags! {
    /// Capability tags for drawables. Polymorphism over these is a
    /// tag check, not a vtable.
    pub struct DrawableFlags: u32 {
        /// Participates in GPU frustum culling
        const CULLABLE = 1 << 0;
        /// Rewritten every frame through the dynamic ring
        const DYNAMIC = 1 << 1;
        /// Generated on the GPU, no CPU side table entry
        const PROCEDURAL = 1 << 2;
    }
}

impl InstanceTier {
    pub fn flags(&self) -> DrawableFlags {
        match self {
            InstanceTier::Static | InstanceTier::SemiStatic => DrawableFlags::CULLABLE,
            InstanceTier::Dynamic => DrawableFlags::DYNAMIC,
            InstanceTier::Procedural => DrawableFlags::PROCEDURAL,
        }
    }
}

/// One slot of the object SSBO, 256 bytes.
///
/// Aligned so a dynamic storage binding can address slot i at offset
/// i * 256. The trailing vectors are per-object shading attributes;
/// unused ones stay zero.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ObjectSlot {
    pub model: Matrix4<f32>,
    pub attrs: [[f32; 4]; 12],
}

impl ObjectSlot {
    pub fn new(model: Matrix4<f32>) -> Self {
        Self {
            model,
            attrs: [[0.0; 4]; 12],
        }
    }

    pub fn identity() -> Self {
        Self::new(Matrix4::identity())
    }
}

/// Instances sharing a key draw together with one indirect command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub mesh: u32,
    pub material: u32,
}

/// Draw parameters for one mesh, supplied by the asset loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshDrawInfo {
    pub vertex_count: u32,
    pub first_vertex: u32,
}

struct InstanceEntry {
    tier: InstanceTier,
    slot: ObjectSlot,
    cull: CullRecord,
}

pub struct StaticBatchManager {
    b_max_instances: u32,
    b_instances: Vec<InstanceEntry>,
    /// (mesh, material) -> dense batch id, in first-seen order
    b_batch_ids: HashMap<BatchKey, u32>,
    /// batch id -> key, the inverse of the above
    b_batch_order: Vec<BatchKey>,
    /// key -> member instance ids
    b_batches: HashMap<BatchKey, Vec<u32>>,
    /// Instance ids whose slot changed since the last flush
    b_dirty: HashSet<u32>,
    b_uploaded: bool,

    /// Device local mirrors, created by upload_to_gpu
    b_instance_buf: Option<GpuBuffer>,
    b_cull_buf: Option<GpuBuffer>,
}

impl StaticBatchManager {
    pub fn new(max_instances: u32) -> Self {
        Self {
            b_max_instances: max_instances,
            b_instances: Vec::new(),
            b_batch_ids: HashMap::new(),
            b_batch_order: Vec::new(),
            b_batches: HashMap::new(),
            b_dirty: HashSet::new(),
            b_uploaded: false,
            b_instance_buf: None,
            b_cull_buf: None,
        }
    }

    /// Register an instance, returning its dense id.
    ///
    /// Only the Static and SemiStatic tiers live here; dynamic
    /// instances go through the render system's per-frame list. The
    /// bounding sphere is world space.
    pub fn add_instance(
        &mut self,
        tier: InstanceTier,
        transform: Matrix4<f32>,
        mesh: u32,
        material: u32,
        sphere: [f32; 4],
    ) -> Result<u32> {
        if tier != InstanceTier::Static && tier != InstanceTier::SemiStatic {
            log::error!("StaticBatchManager: tier must be Static or SemiStatic");
            return Err(SquallError::INVALID);
        }
        if self.b_instances.len() >= self.b_max_instances as usize {
            log::error!("StaticBatchManager: capacity of {} exceeded", self.b_max_instances);
            return Err(SquallError::CAPACITY_EXCEEDED);
        }

        let id = self.b_instances.len() as u32;
        let key = BatchKey { mesh, material };

        let batch_id = match self.b_batch_ids.get(&key) {
            Some(b) => *b,
            None => {
                let b = self.b_batch_order.len() as u32;
                self.b_batch_ids.insert(key, b);
                self.b_batch_order.push(key);
                b
            }
        };

        self.b_instances.push(InstanceEntry {
            tier,
            slot: ObjectSlot::new(transform),
            cull: CullRecord {
                sphere,
                mesh_index: batch_id,
                material_index: material,
                instance_index: id,
                _pad: 0,
            },
        });
        self.b_batches.entry(key).or_insert_with(Vec::new).push(id);

        // Late additions after the first upload ride the dirty path
        if self.b_uploaded {
            self.b_dirty.insert(id);
        }

        Ok(id)
    }

    /// Rewrite an instance's transform.
    ///
    /// Allowed on Static instances too, with a warning: the instance
    /// is reclassified as SemiStatic since it evidently moves.
    pub fn update_transform(&mut self, id: u32, transform: Matrix4<f32>) -> Result<()> {
        let entry = match self.b_instances.get_mut(id as usize) {
            Some(e) => e,
            None => return Err(SquallError::INVALID),
        };

        if entry.tier == InstanceTier::Static {
            log::warn!(
                "StaticBatchManager: updating Static instance {}, reclassifying as SemiStatic",
                id
            );
            entry.tier = InstanceTier::SemiStatic;
        }

        entry.slot.model = transform;
        self.b_dirty.insert(id);
        Ok(())
    }

    pub fn mark_dirty(&mut self, id: u32) {
        if (id as usize) < self.b_instances.len() {
            self.b_dirty.insert(id);
        }
    }

    pub fn instance_count(&self) -> u32 {
        self.b_instances.len() as u32
    }

    pub fn batch_count(&self) -> u32 {
        self.b_batch_order.len() as u32
    }

    pub fn has_dirty(&self) -> bool {
        !self.b_dirty.is_empty()
    }

    pub fn dirty_ids(&self) -> &HashSet<u32> {
        &self.b_dirty
    }

    pub fn is_uploaded(&self) -> bool {
        self.b_uploaded
    }

    pub fn tier_of(&self, id: u32) -> Option<InstanceTier> {
        self.b_instances.get(id as usize).map(|e| e.tier)
    }

    /// The (mesh, material) pair a batch id stands for.
    pub fn batch_key(&self, batch: u32) -> Option<BatchKey> {
        self.b_batch_order.get(batch as usize).copied()
    }

    pub fn instances_in_batch(&self, key: BatchKey) -> Option<&[u32]> {
        self.b_batches.get(&key).map(|v| v.as_slice())
    }

    /// The cull input array, one record per instance in id order.
    pub fn cull_records(&self) -> Vec<CullRecord> {
        self.b_instances.iter().map(|e| e.cull).collect()
    }

    pub fn instance_buffer(&self) -> Option<vk::Buffer> {
        self.b_instance_buf.as_ref().map(|b| b.buffer())
    }

    pub fn cull_buffer(&self) -> Option<vk::Buffer> {
        self.b_cull_buf.as_ref().map(|b| b.buffer())
    }

    /// Mirror the CPU tables into device local SSBOs.
    ///
    /// Buffers are sized for the full capacity so later dirty
    /// flushes and late additions fit without reallocation. The copy
    /// is staged through host visible memory and completes before
    /// this returns.
    pub fn upload_to_gpu(&mut self, dev: &Arc<Device>) -> Result<()> {
        if self.b_instances.is_empty() {
            log::warn!("StaticBatchManager: nothing to upload");
            self.b_uploaded = true;
            return Ok(());
        }

        let slot_size = std::mem::size_of::<ObjectSlot>() as vk::DeviceSize;
        let cull_size = std::mem::size_of::<CullRecord>() as vk::DeviceSize;
        let cap = self.b_max_instances as vk::DeviceSize;

        if self.b_instance_buf.is_none() {
            self.b_instance_buf = Some(GpuBuffer::new(
                dev.clone(),
                cap * slot_size,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                false,
            )?);
            self.b_cull_buf = Some(GpuBuffer::new(
                dev.clone(),
                cap * cull_size,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                false,
            )?);
        }

        let count = self.b_instances.len() as vk::DeviceSize;
        let staging_slots = GpuBuffer::new(
            dev.clone(),
            count * slot_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            true,
        )?;
        let staging_cull = GpuBuffer::new(
            dev.clone(),
            count * cull_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            true,
        )?;

        for (i, entry) in self.b_instances.iter().enumerate() {
            staging_slots.write(i as vk::DeviceSize * slot_size, &[entry.slot]);
            staging_cull.write(i as vk::DeviceSize * cull_size, &[entry.cull]);
        }

        let instance_buf = self.b_instance_buf.as_ref().unwrap();
        let cull_buf = self.b_cull_buf.as_ref().unwrap();
        dev.execute_one_shot(|cmd| unsafe {
            dev.dev.cmd_copy_buffer(
                cmd,
                staging_slots.buffer(),
                instance_buf.buffer(),
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: count * slot_size,
                }],
            );
            dev.dev.cmd_copy_buffer(
                cmd,
                staging_cull.buffer(),
                cull_buf.buffer(),
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: count * cull_size,
                }],
            );
        })?;

        self.b_dirty.clear();
        self.b_uploaded = true;
        log::info!(
            "StaticBatchManager: uploaded {} instances in {} batches",
            self.b_instances.len(),
            self.b_batch_order.len()
        );
        Ok(())
    }

    /// Push only the dirty slots to the GPU. Returns how many were
    /// flushed.
    pub fn flush_dirty(&mut self, dev: &Arc<Device>) -> Result<u32> {
        if self.b_dirty.is_empty() || !self.b_uploaded {
            return Ok(0);
        }
        let instance_buf = match self.b_instance_buf.as_ref() {
            Some(b) => b,
            // upload_to_gpu with an empty table never made buffers
            None => {
                self.b_dirty.clear();
                return Ok(0);
            }
        };
        let cull_buf = self.b_cull_buf.as_ref().unwrap();

        let slot_size = std::mem::size_of::<ObjectSlot>() as vk::DeviceSize;
        let cull_size = std::mem::size_of::<CullRecord>() as vk::DeviceSize;

        let mut ids: Vec<u32> = self.b_dirty.iter().copied().collect();
        ids.sort_unstable();
        let count = ids.len() as vk::DeviceSize;

        let staging_slots = GpuBuffer::new(
            dev.clone(),
            count * slot_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            true,
        )?;
        let staging_cull = GpuBuffer::new(
            dev.clone(),
            count * cull_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            true,
        )?;

        let mut slot_regions = Vec::with_capacity(ids.len());
        let mut cull_regions = Vec::with_capacity(ids.len());
        for (dense, id) in ids.iter().enumerate() {
            let entry = &self.b_instances[*id as usize];
            let src_slot = dense as vk::DeviceSize * slot_size;
            let src_cull = dense as vk::DeviceSize * cull_size;
            staging_slots.write(src_slot, &[entry.slot]);
            staging_cull.write(src_cull, &[entry.cull]);
            slot_regions.push(vk::BufferCopy {
                src_offset: src_slot,
                dst_offset: *id as vk::DeviceSize * slot_size,
                size: slot_size,
            });
            cull_regions.push(vk::BufferCopy {
                src_offset: src_cull,
                dst_offset: *id as vk::DeviceSize * cull_size,
                size: cull_size,
            });
        }

        dev.execute_one_shot(|cmd| unsafe {
            dev.dev.cmd_copy_buffer(
                cmd,
                staging_slots.buffer(),
                instance_buf.buffer(),
                &slot_regions,
            );
            dev.dev
                .cmd_copy_buffer(cmd, staging_cull.buffer(), cull_buf.buffer(), &cull_regions);
        })?;

        let flushed = ids.len() as u32;
        self.b_dirty.clear();
        log::debug!("StaticBatchManager: flushed {} dirty instances", flushed);
        Ok(flushed)
    }

    /// Drop the CPU tables and forget the upload. The GPU buffers
    /// are released too; the next upload recreates them.
    pub fn clear(&mut self) {
        self.b_instances.clear();
        self.b_batch_ids.clear();
        self.b_batch_order.clear();
        self.b_batches.clear();
        self.b_dirty.clear();
        self.b_uploaded = false;
        self.b_instance_buf = None;
        self.b_cull_buf = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::SquareMatrix;
    use memoffset::offset_of;

    fn ident() -> Matrix4<f32> {
        Matrix4::identity()
    }

    #[test]
    fn object_slot_is_256_bytes() {
        assert_eq!(std::mem::size_of::<ObjectSlot>(), 256);
        assert_eq!(offset_of!(ObjectSlot, model), 0);
        assert_eq!(offset_of!(ObjectSlot, attrs), 64);
    }

    #[test]
    fn instances_group_into_batches() {
        let mut mgr = StaticBatchManager::new(16);
        let sphere = [0.0, 0.0, 0.0, 1.0];

        // interleave two (mesh, material) pairs, per the classic
        // two-batch scene
        let a = mgr.add_instance(InstanceTier::Static, ident(), 0, 0, sphere).unwrap();
        let b = mgr.add_instance(InstanceTier::Static, ident(), 1, 0, sphere).unwrap();
        let c = mgr.add_instance(InstanceTier::Static, ident(), 0, 0, sphere).unwrap();
        let d = mgr.add_instance(InstanceTier::Static, ident(), 1, 0, sphere).unwrap();
        assert_eq!((a, b, c, d), (0, 1, 2, 3));

        assert_eq!(mgr.batch_count(), 2);
        assert_eq!(
            mgr.instances_in_batch(BatchKey { mesh: 0, material: 0 }),
            Some(&[0u32, 2][..])
        );
        assert_eq!(
            mgr.instances_in_batch(BatchKey { mesh: 1, material: 0 }),
            Some(&[1u32, 3][..])
        );

        // cull records carry the dense batch id, not the raw mesh
        let records = mgr.cull_records();
        assert_eq!(records[0].mesh_index, 0);
        assert_eq!(records[1].mesh_index, 1);
        assert_eq!(records[3].instance_index, 3);
    }

    #[test]
    fn same_mesh_different_material_is_a_new_batch() {
        let mut mgr = StaticBatchManager::new(16);
        let sphere = [0.0, 0.0, 0.0, 1.0];
        mgr.add_instance(InstanceTier::Static, ident(), 0, 0, sphere).unwrap();
        mgr.add_instance(InstanceTier::Static, ident(), 0, 1, sphere).unwrap();
        assert_eq!(mgr.batch_count(), 2);
    }

    #[test]
    fn rejects_wrong_tier_and_overflow() {
        let mut mgr = StaticBatchManager::new(1);
        let sphere = [0.0, 0.0, 0.0, 1.0];

        assert_eq!(
            mgr.add_instance(InstanceTier::Dynamic, ident(), 0, 0, sphere),
            Err(SquallError::INVALID)
        );

        mgr.add_instance(InstanceTier::Static, ident(), 0, 0, sphere).unwrap();
        assert_eq!(
            mgr.add_instance(InstanceTier::Static, ident(), 0, 0, sphere),
            Err(SquallError::CAPACITY_EXCEEDED)
        );
    }

    #[test]
    fn transform_update_marks_dirty_and_reclassifies() {
        let mut mgr = StaticBatchManager::new(4);
        let sphere = [0.0, 0.0, 0.0, 1.0];
        let id = mgr
            .add_instance(InstanceTier::Static, ident(), 0, 0, sphere)
            .unwrap();

        assert!(!mgr.has_dirty());
        mgr.update_transform(id, Matrix4::from_scale(2.0)).unwrap();
        assert!(mgr.dirty_ids().contains(&id));
        // a Static instance that moved is SemiStatic from now on
        assert_eq!(mgr.tier_of(id), Some(InstanceTier::SemiStatic));

        assert_eq!(
            mgr.update_transform(99, ident()),
            Err(SquallError::INVALID)
        );
    }

    #[test]
    fn clear_resets_everything() {
        let mut mgr = StaticBatchManager::new(4);
        let sphere = [0.0, 0.0, 0.0, 1.0];
        mgr.add_instance(InstanceTier::Static, ident(), 0, 0, sphere).unwrap();
        mgr.clear();
        assert_eq!(mgr.instance_count(), 0);
        assert_eq!(mgr.batch_count(), 0);
        assert!(!mgr.is_uploaded());
    }

    #[test]
    fn tier_capability_tags() {
        assert!(InstanceTier::Static.flags().contains(DrawableFlags::CULLABLE));
        assert!(InstanceTier::Dynamic.flags().contains(DrawableFlags::DYNAMIC));
        assert!(!InstanceTier::Dynamic.flags().contains(DrawableFlags::CULLABLE));
    }
}
