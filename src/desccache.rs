// Texture keyed descriptor cache
//
// Materials sample textures through a per-texture descriptor set.
// The cache maps texture id -> set, and keeps a strong reference to
// the texture in a reverse map so the view and sampler outlive any
// pipeline that may still sample them. Trimming walks the cache and
// evicts everything the current scene no longer references.
//
// Austin Shafer - 2025
use ash::vk;

use crate::descpool::DescPool;
use crate::device::Device;
use crate::layouts::LayoutRegistry;
use crate::Result;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Layout key for textured materials. See `layouts` for the key set.
pub const TEXTURED_MAT_KEY: &str = "textured_mat";

/// A sampled texture.
///
/// The image itself is uploaded by the asset loader; we own the
/// handles from then on and release them when the last strong
/// reference drops.
pub struct Texture {
    t_dev: Arc<Device>,
    /// Stable id the scene refers to this texture by
    pub id: u32,
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) sampler: vk::Sampler,
    mem: vk::DeviceMemory,
}

impl Texture {
    /// Adopt handles created by the loader.
    pub fn from_raw(
        dev: Arc<Device>,
        id: u32,
        image: vk::Image,
        view: vk::ImageView,
        sampler: vk::Sampler,
        mem: vk::DeviceMemory,
    ) -> Arc<Self> {
        Arc::new(Self {
            t_dev: dev,
            id,
            image,
            view,
            sampler,
            mem,
        })
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.t_dev.dev.destroy_sampler(self.sampler, None);
            self.t_dev.dev.destroy_image_view(self.view, None);
            self.t_dev.dev.destroy_image(self.image, None);
            self.t_dev.dev.free_memory(self.mem, None);
        }
    }
}

/// Register the textured material layout with the registry.
///
/// Binding 0 is the combined image sampler, binding 1 the per-object
/// slot SSBO the vertex shader indexes with its instance id.
pub fn register_textured_mat_layout(registry: &mut LayoutRegistry) -> Result<()> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .descriptor_count(1)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .descriptor_count(1)
            .build(),
    ];
    registry.register(TEXTURED_MAT_KEY, &bindings)?;
    Ok(())
}

pub struct TextureDescCache {
    c_dev: Arc<Device>,
    /// texture id -> descriptor set
    c_forward: HashMap<u32, vk::DescriptorSet>,
    /// descriptor set -> the texture it samples. Holding the Arc here
    /// is what keeps the view/sampler alive while the set exists.
    c_reverse: HashMap<vk::DescriptorSet, Arc<Texture>>,
}

impl TextureDescCache {
    pub fn new(dev: Arc<Device>) -> Self {
        Self {
            c_dev: dev,
            c_forward: HashMap::new(),
            c_reverse: HashMap::new(),
        }
    }

    /// Get the cached set for `texture`, allocating and writing a new
    /// one on first sight.
    pub fn get_or_create(
        &mut self,
        pool: &mut DescPool,
        registry: &LayoutRegistry,
        texture: &Arc<Texture>,
        object_buffer: vk::Buffer,
    ) -> Result<vk::DescriptorSet> {
        if let Some(set) = self.c_forward.get(&texture.id) {
            return Ok(*set);
        }

        let set = pool.allocate(registry, TEXTURED_MAT_KEY)?;

        let image_info = [vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(texture.view)
            .sampler(texture.sampler)
            .build()];
        let buffer_info = [vk::DescriptorBufferInfo::builder()
            .buffer(object_buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
            .build()];

        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&buffer_info)
                .build(),
        ];
        unsafe {
            self.c_dev.dev.update_descriptor_sets(&writes, &[]);
        }

        self.c_forward.insert(texture.id, set);
        self.c_reverse.insert(set, texture.clone());
        Ok(set)
    }

    /// Evict every cached set whose texture the scene no longer
    /// references. Returns how many were freed.
    pub fn cleanup_unused(&mut self, pool: &mut DescPool, referenced: &HashSet<u32>) -> usize {
        let stale: Vec<u32> = self
            .c_forward
            .keys()
            .filter(|id| !referenced.contains(id))
            .copied()
            .collect();

        for id in stale.iter() {
            if let Some(set) = self.c_forward.remove(id) {
                pool.free(set);
                // dropping the Arc releases the texture if we held
                // the last reference
                self.c_reverse.remove(&set);
            }
        }

        if !stale.is_empty() {
            log::debug!("TextureDescCache: evicted {} unused sets", stale.len());
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.c_forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.c_forward.is_empty()
    }
}
