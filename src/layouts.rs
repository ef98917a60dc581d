// Descriptor set layout registry
//
// Layouts are cached by free-form string key. The key set is a
// closed enum by convention so the material system can stay
// data-driven:
//
//   "obj"           - per object uniform + sampler
//   "textured_mat"  - combined image sampler + per object SSBO
//   "cull"          - the culler's internal set (owned by GpuCuller)
//   "scene"         - frame globals (view/projection, lights)
//
// Registration is idempotent: the first bindings win and later calls
// with the same key get the cached handle back.
//
// Austin Shafer - 2025
use ash::vk;

use crate::device::Device;
use crate::{Result, SquallError};

use std::collections::HashMap;
use std::sync::Arc;

struct LayoutEntry {
    layout: vk::DescriptorSetLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

/// Aggregate descriptor pool sizes over a group of layouts.
///
/// For each descriptor type, the size is `max_sets` times the worst
/// case consumption of any single layout: the per-layout sum of
/// descriptor counts for that type, maximized across layouts. A pool
/// sized this way can hold `max_sets` sets of any registered layout.
pub fn aggregate_pool_sizes(
    binding_sets: &[&[vk::DescriptorSetLayoutBinding]],
    max_sets: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let mut max_per_set: Vec<(vk::DescriptorType, u32)> = Vec::new();

    for bindings in binding_sets.iter() {
        let mut sum_by_type: Vec<(vk::DescriptorType, u32)> = Vec::new();
        for b in bindings.iter() {
            match sum_by_type.iter_mut().find(|(ty, _)| *ty == b.descriptor_type) {
                Some((_, count)) => *count += b.descriptor_count,
                None => sum_by_type.push((b.descriptor_type, b.descriptor_count)),
            }
        }

        for (ty, sum) in sum_by_type {
            match max_per_set.iter_mut().find(|(t, _)| *t == ty) {
                Some((_, max)) => *max = (*max).max(sum),
                None => max_per_set.push((ty, sum)),
            }
        }
    }

    max_per_set
        .into_iter()
        .map(|(ty, count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count: count * max_sets,
        })
        .collect()
}

pub struct LayoutRegistry {
    l_dev: Arc<Device>,
    l_layouts: HashMap<String, LayoutEntry>,
}

impl LayoutRegistry {
    pub fn new(dev: Arc<Device>) -> Self {
        Self {
            l_dev: dev,
            l_layouts: HashMap::new(),
        }
    }

    /// Create and cache a layout under `key`.
    ///
    /// If the key is already registered the cached handle is
    /// returned and `bindings` is ignored.
    pub fn register(
        &mut self,
        key: &str,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        if let Some(entry) = self.l_layouts.get(key) {
            return Ok(entry.layout);
        }
        if bindings.is_empty() {
            log::error!("LayoutRegistry: empty bindings for key '{}'", key);
            return Err(SquallError::INVALID);
        }

        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        let layout = unsafe {
            self.l_dev
                .dev
                .create_descriptor_set_layout(&info, None)
                .or(Err(SquallError::ALLOCATION_FAILED))?
        };

        self.l_layouts.insert(
            key.to_owned(),
            LayoutEntry {
                layout,
                bindings: bindings.to_vec(),
            },
        );
        Ok(layout)
    }

    pub fn get(&self, key: &str) -> Option<vk::DescriptorSetLayout> {
        self.l_layouts.get(key).map(|e| e.layout)
    }

    pub fn bindings(&self, key: &str) -> Option<&[vk::DescriptorSetLayoutBinding]> {
        self.l_layouts.get(key).map(|e| e.bindings.as_slice())
    }

    /// Pool sizes big enough for `max_sets` sets of any layout in
    /// `keys`. Unregistered keys are skipped.
    pub fn pool_sizes_for(&self, keys: &[String], max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let binding_sets: Vec<&[vk::DescriptorSetLayoutBinding]> = keys
            .iter()
            .filter_map(|k| self.bindings(k))
            .collect();
        aggregate_pool_sizes(&binding_sets, max_sets)
    }
}

impl Drop for LayoutRegistry {
    fn drop(&mut self) {
        unsafe {
            for (_, entry) in self.l_layouts.drain() {
                self.l_dev
                    .dev
                    .destroy_descriptor_set_layout(entry.layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(ty: vk::DescriptorType, count: u32) -> vk::DescriptorSetLayoutBinding {
        vk::DescriptorSetLayoutBinding {
            descriptor_type: ty,
            descriptor_count: count,
            ..Default::default()
        }
    }

    fn size_of(sizes: &[vk::DescriptorPoolSize], ty: vk::DescriptorType) -> Option<u32> {
        sizes
            .iter()
            .find(|s| s.ty == ty)
            .map(|s| s.descriptor_count)
    }

    #[test]
    fn aggregation_takes_max_over_keys() {
        // key A: 2 uniforms. key B: 3 uniforms + 1 sampler.
        let a = [
            binding(vk::DescriptorType::UNIFORM_BUFFER, 1),
            binding(vk::DescriptorType::UNIFORM_BUFFER, 1),
        ];
        let b = [
            binding(vk::DescriptorType::UNIFORM_BUFFER, 3),
            binding(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
        ];

        let sizes = aggregate_pool_sizes(&[&a, &b], 10);
        assert_eq!(sizes.len(), 2);
        assert_eq!(size_of(&sizes, vk::DescriptorType::UNIFORM_BUFFER), Some(30));
        assert_eq!(
            size_of(&sizes, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            Some(10)
        );
    }

    #[test]
    fn aggregation_sums_within_a_key() {
        let a = [
            binding(vk::DescriptorType::STORAGE_BUFFER, 2),
            binding(vk::DescriptorType::STORAGE_BUFFER, 4),
        ];
        let sizes = aggregate_pool_sizes(&[&a], 5);
        assert_eq!(size_of(&sizes, vk::DescriptorType::STORAGE_BUFFER), Some(30));
    }

    #[test]
    fn aggregation_of_nothing_is_empty() {
        assert!(aggregate_pool_sizes(&[], 10).is_empty());
    }
}
