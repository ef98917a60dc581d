// A growable allocator for descriptor sets
//
// One logical pool made of a list of VkDescriptorPools. When every
// pool is exhausted we append a bigger one; existing pools are never
// freed while the manager lives, because sets are not relocatable
// and callers hold them across frames.
//
// Sets are not tracked back to the pool they came from, so free()
// walks the pool list. A (set -> pool) map would be friendlier to
// validation layers; until then the walk matches what the pools
// themselves enforce.
//
// Austin Shafer - 2025
use ash::vk;

use crate::device::Device;
use crate::layouts::LayoutRegistry;
use crate::{Result, SquallError};

use std::sync::Arc;

/// Capacity after a growth step: double, clamped to the device
/// ceiling. None when we are already at the ceiling.
fn next_capacity(current: u32, ceiling: u32) -> Option<u32> {
    if current >= ceiling {
        return None;
    }
    Some((current * 2).min(ceiling))
}

/// One-shot warnings when usage crosses 75% and then 90%.
/// Both latches reset when the pool grows.
#[derive(Debug, Default, Clone, Copy)]
struct CapacityWarnings {
    warned_75: bool,
    warned_90: bool,
}

impl CapacityWarnings {
    /// Returns the threshold crossed on this allocation, if any.
    fn check(&mut self, allocated: u32, capacity: u32) -> Option<u32> {
        if capacity == 0 {
            return None;
        }
        let pct = allocated as u64 * 100 / capacity as u64;
        if !self.warned_90 && pct >= 90 {
            self.warned_90 = true;
            // 90 implies 75, don't fire both on one allocation
            self.warned_75 = true;
            return Some(90);
        }
        if !self.warned_75 && pct >= 75 {
            self.warned_75 = true;
            return Some(75);
        }
        None
    }

    fn reset(&mut self) {
        self.warned_75 = false;
        self.warned_90 = false;
    }
}

pub struct DescPool {
    d_dev: Arc<Device>,
    /// Oldest first. Allocation tries newest first since older pools
    /// are more likely to be full.
    d_pools: Vec<vk::DescriptorPool>,
    /// Tracked set capacity. Doubles on growth.
    d_capacity: u32,
    d_allocated: u32,
    /// Hard cap from the device / config
    d_ceiling: u32,
    /// Layout keys this pool was sized for, kept for growth
    d_keys: Vec<String>,
    d_warnings: CapacityWarnings,
}

impl DescPool {
    pub fn new(dev: Arc<Device>, ceiling: u32) -> Self {
        Self {
            d_dev: dev,
            d_pools: Vec::new(),
            d_capacity: 0,
            d_allocated: 0,
            d_ceiling: ceiling,
            d_keys: Vec::new(),
            d_warnings: CapacityWarnings::default(),
        }
    }

    fn create_pool(
        &self,
        registry: &LayoutRegistry,
        capacity: u32,
    ) -> Result<vk::DescriptorPool> {
        let sizes = registry.pool_sizes_for(&self.d_keys, capacity);
        if sizes.is_empty() {
            log::error!("DescPool: no pool sizes from layout keys {:?}", self.d_keys);
            return Err(SquallError::INVALID);
        }

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            // the texture cache evicts individual sets
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(capacity);

        unsafe {
            self.d_dev
                .dev
                .create_descriptor_pool(&info, None)
                .or(Err(SquallError::ALLOCATION_FAILED))
        }
    }

    /// Tear down any existing pools and build the initial one sized
    /// for `initial_capacity` sets of the worst layout in `keys`.
    pub fn build_pool(
        &mut self,
        registry: &LayoutRegistry,
        keys: &[String],
        initial_capacity: u32,
    ) -> Result<()> {
        self.destroy_pools();
        self.d_keys = keys.to_vec();
        self.d_capacity = initial_capacity;
        self.d_allocated = 0;
        self.d_warnings.reset();

        let pool = self.create_pool(registry, initial_capacity)?;
        self.d_pools.push(pool);
        log::info!(
            "DescPool: created initial pool with capacity {}",
            initial_capacity
        );
        Ok(())
    }

    fn try_allocate_from(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .build();
        unsafe {
            self.d_dev
                .dev
                .allocate_descriptor_sets(&info)
                .map(|sets| sets[0])
        }
    }

    /// Allocate a set with the layout registered under `key`.
    ///
    /// Walks the pool list newest to oldest. When everything is full
    /// the tracked capacity doubles (clamped to the ceiling), one new
    /// pool sized for the doubled capacity is appended, and the
    /// allocation is retried there. Older sets stay valid throughout.
    pub fn allocate(
        &mut self,
        registry: &LayoutRegistry,
        key: &str,
    ) -> Result<vk::DescriptorSet> {
        let layout = match registry.get(key) {
            Some(l) => l,
            None => {
                log::error!("DescPool: unknown layout key '{}'", key);
                return Err(SquallError::INVALID);
            }
        };
        if self.d_pools.is_empty() {
            return Err(SquallError::INVALID);
        }

        for pool in self.d_pools.iter().rev() {
            match self.try_allocate_from(*pool, layout) {
                Ok(set) => {
                    self.d_allocated += 1;
                    if let Some(pct) = self.d_warnings.check(self.d_allocated, self.d_capacity) {
                        log::warn!(
                            "DescPool: {}% capacity ({}/{})",
                            pct,
                            self.d_allocated,
                            self.d_capacity
                        );
                    }
                    return Ok(set);
                }
                // full or fragmented, try an older pool
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => continue,
                Err(vk::Result::ERROR_FRAGMENTED_POOL) => continue,
                Err(e) => {
                    log::error!("DescPool: allocation failed for '{}': {:?}", key, e);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            }
        }

        // Every pool is exhausted, grow
        let new_capacity = match next_capacity(self.d_capacity, self.d_ceiling) {
            Some(c) => c,
            None => {
                log::error!(
                    "DescPool: cannot grow beyond device ceiling of {} sets",
                    self.d_ceiling
                );
                return Err(SquallError::DESCRIPTOR_POOL_EXHAUSTED);
            }
        };

        log::warn!(
            "DescPool: growing from {} to {} sets",
            self.d_capacity,
            new_capacity
        );
        let pool = self.create_pool(registry, new_capacity)?;
        self.d_pools.push(pool);
        self.d_capacity = new_capacity;
        self.d_warnings.reset();

        match self.try_allocate_from(pool, layout) {
            Ok(set) => {
                self.d_allocated += 1;
                Ok(set)
            }
            Err(e) => {
                log::error!("DescPool: allocation failed after growth: {:?}", e);
                Err(SquallError::ALLOCATION_FAILED)
            }
        }
    }

    /// Return a set to whichever pool it came from.
    pub fn free(&mut self, set: vk::DescriptorSet) {
        unsafe {
            for pool in self.d_pools.iter() {
                if self.d_dev.dev.free_descriptor_sets(*pool, &[set]).is_ok() {
                    if self.d_allocated > 0 {
                        self.d_allocated -= 1;
                    }
                    return;
                }
            }
        }
    }

    pub fn capacity(&self) -> u32 {
        self.d_capacity
    }

    pub fn allocated(&self) -> u32 {
        self.d_allocated
    }

    pub fn pool_count(&self) -> usize {
        self.d_pools.len()
    }

    fn destroy_pools(&mut self) {
        unsafe {
            for pool in self.d_pools.drain(..) {
                self.d_dev.dev.destroy_descriptor_pool(pool, None);
            }
        }
    }
}

impl Drop for DescPool {
    fn drop(&mut self) {
        self.destroy_pools();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_doubles_until_ceiling() {
        // the S-curve for a pool built at 3 with ceiling 100:
        // 3 -> 6 -> 12 -> 24 -> 48 -> 96 -> 100 -> exhausted
        let mut cap = 3;
        let mut seen = Vec::new();
        while let Some(next) = next_capacity(cap, 100) {
            seen.push(next);
            cap = next;
        }
        assert_eq!(seen, vec![6, 12, 24, 48, 96, 100]);
        assert_eq!(next_capacity(cap, 100), None);
    }

    #[test]
    fn growth_clamps_exactly_at_ceiling() {
        assert_eq!(next_capacity(64, 100), Some(100));
        assert_eq!(next_capacity(100, 100), None);
        assert_eq!(next_capacity(200, 100), None);
    }

    #[test]
    fn warnings_fire_once_per_threshold() {
        let mut w = CapacityWarnings::default();
        assert_eq!(w.check(1, 10), None);
        assert_eq!(w.check(7, 10), None); // 70%
        assert_eq!(w.check(8, 10), Some(75));
        assert_eq!(w.check(8, 10), None); // latched
        assert_eq!(w.check(9, 10), Some(90));
        assert_eq!(w.check(10, 10), None); // latched

        // growth resets both
        w.reset();
        assert_eq!(w.check(9, 20), None); // 45% of the new capacity
        assert_eq!(w.check(18, 20), Some(90));
    }

    #[test]
    fn jumping_straight_past_90_fires_only_90() {
        let mut w = CapacityWarnings::default();
        assert_eq!(w.check(19, 20), Some(90));
        assert_eq!(w.check(20, 20), None);
    }
}
