// GPU buffer ownership
//
// A GpuBuffer is a VkBuffer + VkDeviceMemory pair with optional
// persistent mapping. A RingBuffer partitions one persistently
// mapped GpuBuffer into per-frame-in-flight regions so that CPU
// writes for frame N never race GPU reads for frame N-1.
//
// Austin Shafer - 2025
use ash::vk;

use crate::device::Device;
use crate::{Result, SquallError};

use std::marker::PhantomData;
use std::os::raw::c_void;
use std::sync::Arc;

/// A device memory backed buffer.
///
/// Move-only: owns its handles and releases them on drop, unmapping
/// first iff the buffer was persistently mapped. The buffer and
/// memory are either both valid or the object does not exist, there
/// is no half-constructed state to observe.
pub struct GpuBuffer {
    b_dev: Arc<Device>,
    b_buffer: vk::Buffer,
    b_memory: vk::DeviceMemory,
    b_size: vk::DeviceSize,
    /// Non-null iff persistently mapped
    b_mapped: *mut c_void,
    b_persistent: bool,
}

// Only vulkan handles and a pointer into device memory in here. Use
// is externally synchronized; the resource worker drops these after
// they have been fenced out of the frame.
unsafe impl Send for GpuBuffer {}

impl GpuBuffer {
    /// Create a buffer of `size` bytes.
    ///
    /// Memory type selection takes the first type satisfying both
    /// the buffer's requirement mask and `props`. If `persistent` is
    /// set the whole range is mapped now and stays mapped for the
    /// lifetime of the object; `props` must include HOST_VISIBLE.
    /// Any failure tears down whatever was created so far.
    pub fn new(
        dev: Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
        persistent: bool,
    ) -> Result<Self> {
        if size == 0 {
            return Err(SquallError::INVALID);
        }

        unsafe {
            let info = vk::BufferCreateInfo::builder()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = dev
                .dev
                .create_buffer(&info, None)
                .or(Err(SquallError::ALLOCATION_FAILED))?;

            let reqs = dev.dev.get_buffer_memory_requirements(buffer);
            let mem_type = match dev.find_memory_type_index(&reqs, props) {
                Some(t) => t,
                None => {
                    dev.dev.destroy_buffer(buffer, None);
                    return Err(SquallError::NO_SUITABLE_MEMORY_TYPE);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(reqs.size)
                .memory_type_index(mem_type);
            let memory = match dev.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    dev.dev.destroy_buffer(buffer, None);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            };

            if dev.dev.bind_buffer_memory(buffer, memory, 0).is_err() {
                dev.dev.free_memory(memory, None);
                dev.dev.destroy_buffer(buffer, None);
                return Err(SquallError::ALLOCATION_FAILED);
            }

            let mut mapped = std::ptr::null_mut();
            if persistent {
                if !props.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                    dev.dev.free_memory(memory, None);
                    dev.dev.destroy_buffer(buffer, None);
                    return Err(SquallError::INVALID);
                }
                mapped = match dev
                    .dev
                    .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                {
                    Ok(p) => p,
                    Err(_) => {
                        dev.dev.free_memory(memory, None);
                        dev.dev.destroy_buffer(buffer, None);
                        return Err(SquallError::ALLOCATION_FAILED);
                    }
                };
            }

            Ok(Self {
                b_dev: dev,
                b_buffer: buffer,
                b_memory: memory,
                b_size: size,
                b_mapped: mapped,
                b_persistent: persistent,
            })
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.b_buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.b_size
    }

    pub fn is_mapped(&self) -> bool {
        !self.b_mapped.is_null()
    }

    /// Pointer into the persistent mapping at `offset` bytes.
    pub fn mapped_ptr(&self, offset: vk::DeviceSize) -> Option<*mut u8> {
        if self.b_mapped.is_null() || offset >= self.b_size {
            return None;
        }
        Some(unsafe { (self.b_mapped as *mut u8).add(offset as usize) })
    }

    /// Explicitly map a range. Forbidden on persistent buffers, the
    /// mapping already exists for those.
    pub fn map(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<*mut c_void> {
        if self.b_persistent {
            return Err(SquallError::INVALID);
        }
        let map_size = if size == vk::WHOLE_SIZE {
            self.b_size - offset
        } else {
            size
        };
        unsafe {
            self.b_dev
                .dev
                .map_memory(self.b_memory, offset, map_size, vk::MemoryMapFlags::empty())
                .or(Err(SquallError::ALLOCATION_FAILED))
        }
    }

    /// Undo an explicit `map`. Forbidden on persistent buffers.
    pub fn unmap(&self) -> Result<()> {
        if self.b_persistent {
            return Err(SquallError::INVALID);
        }
        unsafe { self.b_dev.dev.unmap_memory(self.b_memory) };
        Ok(())
    }

    /// Flush a mapped range to the device.
    ///
    /// Semantically a no-op on HOST_COHERENT memory but always legal
    /// to call.
    pub fn flush(&self, offset: vk::DeviceSize, size: vk::DeviceSize) {
        let range = [vk::MappedMemoryRange::builder()
            .memory(self.b_memory)
            .offset(offset)
            .size(size)
            .build()];
        unsafe {
            let _ = self.b_dev.dev.flush_mapped_memory_ranges(&range);
        }
    }

    /// Invalidate a mapped range after a device write.
    pub fn invalidate(&self, offset: vk::DeviceSize, size: vk::DeviceSize) {
        let range = [vk::MappedMemoryRange::builder()
            .memory(self.b_memory)
            .offset(offset)
            .size(size)
            .build()];
        unsafe {
            let _ = self.b_dev.dev.invalidate_mapped_memory_ranges(&range);
        }
    }

    /// Copy `data` into the persistent mapping at `byte_offset`.
    pub fn write<T: Copy>(&self, byte_offset: vk::DeviceSize, data: &[T]) {
        let len = (data.len() * std::mem::size_of::<T>()) as vk::DeviceSize;
        debug_assert!(byte_offset + len <= self.b_size);

        if let Some(dst) = self.mapped_ptr(byte_offset) {
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, dst, len as usize);
            }
        }
    }

    /// Copy out of the persistent mapping into `out`.
    pub fn read<T: Copy>(&self, byte_offset: vk::DeviceSize, out: &mut [T]) {
        let len = (out.len() * std::mem::size_of::<T>()) as vk::DeviceSize;
        debug_assert!(byte_offset + len <= self.b_size);

        if let Some(src) = self.mapped_ptr(byte_offset) {
            unsafe {
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr() as *mut u8, len as usize);
            }
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            // unmap on destruction iff persistent
            if !self.b_mapped.is_null() {
                self.b_dev.dev.unmap_memory(self.b_memory);
            }
            self.b_dev.dev.destroy_buffer(self.b_buffer, None);
            self.b_dev.dev.free_memory(self.b_memory, None);
        }
    }
}

/// The offset arithmetic of a frame ring, kept separate from the
/// buffer so the region math is checkable on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub frames: u32,
    pub elements_per_frame: u32,
    pub element_size: vk::DeviceSize,
}

impl RingLayout {
    pub fn frame_size(&self) -> vk::DeviceSize {
        self.elements_per_frame as vk::DeviceSize * self.element_size
    }

    pub fn total_size(&self) -> vk::DeviceSize {
        self.frame_size() * self.frames as vk::DeviceSize
    }

    /// Byte offset of frame `f`'s region.
    pub fn frame_offset(&self, frame: u32) -> vk::DeviceSize {
        debug_assert!(frame < self.frames);
        frame as vk::DeviceSize * self.frame_size()
    }

    /// Byte offset of element `i` in frame `f`, for dynamic
    /// descriptor binding offsets.
    pub fn element_offset(&self, frame: u32, element: u32) -> vk::DeviceSize {
        debug_assert!(element < self.elements_per_frame);
        self.frame_offset(frame) + element as vk::DeviceSize * self.element_size
    }
}

/// N-frame partition over a single persistently mapped buffer.
///
/// There is no internal frame counter here. The frame loop owns the
/// current frame index and passes it in, so the ring cannot drift
/// out of step with the in-flight fences.
pub struct RingBuffer<T: Copy> {
    r_layout: RingLayout,
    r_buf: GpuBuffer,
    _phantom: PhantomData<T>,
}

impl<T: Copy> RingBuffer<T> {
    pub fn new(
        dev: Arc<Device>,
        elements_per_frame: u32,
        frames: u32,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        if elements_per_frame == 0 || frames == 0 {
            return Err(SquallError::INVALID);
        }

        let layout = RingLayout {
            frames,
            elements_per_frame,
            element_size: std::mem::size_of::<T>() as vk::DeviceSize,
        };

        let buf = GpuBuffer::new(
            dev,
            layout.total_size(),
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            true, // persistent
        )?;

        Ok(Self {
            r_layout: layout,
            r_buf: buf,
            _phantom: PhantomData,
        })
    }

    pub fn layout(&self) -> &RingLayout {
        &self.r_layout
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.r_buf.buffer()
    }

    pub fn frame_offset(&self, frame: u32) -> vk::DeviceSize {
        self.r_layout.frame_offset(frame)
    }

    pub fn element_offset(&self, frame: u32, element: u32) -> vk::DeviceSize {
        self.r_layout.element_offset(frame, element)
    }

    /// Pointer to the start of frame `f`'s element array.
    pub fn frame_ptr(&self, frame: u32) -> *mut T {
        self.r_buf
            .mapped_ptr(self.r_layout.frame_offset(frame))
            .unwrap() as *mut T
    }

    /// Copy `data` into the head of frame `f`'s region.
    pub fn write_frame(&self, frame: u32, data: &[T]) -> Result<()> {
        if data.len() > self.r_layout.elements_per_frame as usize {
            return Err(SquallError::CAPACITY_EXCEEDED);
        }
        self.r_buf.write(self.r_layout.frame_offset(frame), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_regions_do_not_alias() {
        let layout = RingLayout {
            frames: 3,
            elements_per_frame: 128,
            element_size: 256,
        };

        // every frame region ends before the next one begins, and
        // the last region ends inside the buffer
        for f in 0..layout.frames {
            assert!(layout.frame_offset(f) + layout.frame_size() <= layout.total_size());
            if f > 0 {
                assert_eq!(
                    layout.frame_offset(f - 1) + layout.frame_size(),
                    layout.frame_offset(f)
                );
            }
        }
    }

    #[test]
    fn ring_element_offsets() {
        let layout = RingLayout {
            frames: 2,
            elements_per_frame: 16,
            element_size: 64,
        };

        assert_eq!(layout.element_offset(0, 0), 0);
        assert_eq!(layout.element_offset(0, 5), 5 * 64);
        assert_eq!(layout.element_offset(1, 0), 16 * 64);
        assert_eq!(layout.element_offset(1, 3), 16 * 64 + 3 * 64);
        assert_eq!(layout.total_size(), 2 * 16 * 64);
    }
}
