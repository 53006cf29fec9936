use crate::{
    buffers::{copy_buffer_region, create_buffer, fill_buffer},
    commands::create_transfer_pool,
    context::Context,
    error::{GeometryError, MapError},
};

use vulkanalia::prelude::v1_0::*;
use anyhow::Result;
use log::*;

/// Where the store's memory lives. Device-only is the default
/// for static scene geometry; host-visible supports direct maps
/// for geometry rewritten every frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryProfile {
    DeviceOnly,
    HostVisible,
}

impl MemoryProfile {
    fn properties(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryProfile::DeviceOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryProfile::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }
}

/// Where a geometry's data begins inside the store, in elements.
/// Returned by [`GeometryStore::add_geometry`]; draw calls offset
/// their vertex and index ranges by these.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GeometrySlot {
    pub vertex_offset: u64,
    pub index_offset: u64,
}

struct Region {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    stride: u64,
    count: u64,
    usage: vk::BufferUsageFlags,
}

/// Packed vertex and index storage shared by every geometry in a
/// scene. Geometries append at the tail; removal compacts the
/// buffers through host-visible staging so the survivors stay
/// contiguous. Both operations reallocate, so callers must only
/// resize between frames, with no draw in flight that references
/// the store.
pub struct GeometryStore {
    vertices: Region,
    indices: Region,
    profile: MemoryProfile,
    transfer_pool: vk::CommandPool,
    resizing: bool,
}

impl GeometryStore {
    /// An empty store. `vertex_stride` and `index_stride` are the
    /// byte sizes of one vertex and one index; all offsets and
    /// counts thereafter are in elements.
    pub fn new(
        context: &Context,
        vertex_stride: u64,
        index_stride: u64,
        profile: MemoryProfile,
    ) -> Result<Self> {
        // Every count/byte conversion divides or multiplies by
        // the stride; a zero stride can never describe elements.
        if vertex_stride == 0 || index_stride == 0 {
            return Err(GeometryError::ZeroStride.into());
        }

        let transfer_pool = create_transfer_pool(context)?;

        Ok(Self {
            vertices: Region {
                buffer: vk::Buffer::null(),
                memory: vk::DeviceMemory::null(),
                stride: vertex_stride,
                count: 0,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            },
            indices: Region {
                buffer: vk::Buffer::null(),
                memory: vk::DeviceMemory::null(),
                stride: index_stride,
                count: 0,
                usage: vk::BufferUsageFlags::INDEX_BUFFER,
            },
            profile,
            transfer_pool,
            resizing: false,
        })
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.buffer
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.indices.buffer
    }

    pub fn vertex_count(&self) -> u64 {
        self.vertices.count
    }

    pub fn index_count(&self) -> u64 {
        self.indices.count
    }

    /// Appends a geometry's vertex and index data and returns the
    /// element offsets it landed at. The previous contents are
    /// carried over with device-side copies; the new data arrives
    /// through a host-visible staging buffer.
    pub fn add_geometry(
        &mut self,
        context: &Context,
        vertex_data: &[u8],
        index_data: &[u8],
    ) -> Result<GeometrySlot> {
        self.resizing = true;
        let result = self.add_geometry_inner(context, vertex_data, index_data);
        self.resizing = false;
        result
    }

    fn add_geometry_inner(
        &mut self,
        context: &Context,
        vertex_data: &[u8],
        index_data: &[u8],
    ) -> Result<GeometrySlot> {
        // Both inputs are validated before either region is
        // touched, so a rejected call changes nothing.
        check_data_len(vertex_data.len() as u64, self.vertices.stride)?;
        check_data_len(index_data.len() as u64, self.indices.stride)?;

        let slot = GeometrySlot {
            vertex_offset: self.vertices.count,
            index_offset: self.indices.count,
        };

        extend_region(context, self.transfer_pool, self.profile, &mut self.vertices, vertex_data)?;
        extend_region(context, self.transfer_pool, self.profile, &mut self.indices, index_data)?;

        debug!(
            "Geometry added at v={}, i={} ({} vertices, {} indices total).",
            slot.vertex_offset,
            slot.index_offset,
            self.vertices.count,
            self.indices.count
        );
        Ok(slot)
    }

    /// Removes the element ranges of one geometry and compacts
    /// the store. Survivors keep their relative order; anything
    /// past the removed range shifts down by the removed count,
    /// so callers holding offsets past the range must rebase
    /// them.
    pub fn remove_geometry(
        &mut self,
        context: &Context,
        slot: GeometrySlot,
        vertex_count: u64,
        index_count: u64,
    ) -> Result<()> {
        self.resizing = true;
        let result = self.remove_geometry_inner(context, slot, vertex_count, index_count);
        self.resizing = false;
        result
    }

    fn remove_geometry_inner(
        &mut self,
        context: &Context,
        slot: GeometrySlot,
        vertex_count: u64,
        index_count: u64,
    ) -> Result<()> {
        // Both ranges are validated before either region is
        // touched, so a rejected call changes nothing.
        check_range(slot.vertex_offset, vertex_count, self.vertices.count)?;
        check_range(slot.index_offset, index_count, self.indices.count)?;

        shrink_region(
            context,
            self.transfer_pool,
            self.profile,
            &mut self.vertices,
            slot.vertex_offset,
            vertex_count,
        )?;
        shrink_region(
            context,
            self.transfer_pool,
            self.profile,
            &mut self.indices,
            slot.index_offset,
            index_count,
        )?;

        debug!(
            "Geometry removed ({} vertices, {} indices remain).",
            self.vertices.count, self.indices.count
        );
        Ok(())
    }

    /// Maps the vertex buffer for direct writes. Refused while a
    /// resize is in flight and refused outright on device-only
    /// stores, where no host mapping exists.
    pub fn map_vertices(&self, context: &Context) -> Result<*mut u8> {
        self.map(context, &self.vertices)
    }

    pub fn map_indices(&self, context: &Context) -> Result<*mut u8> {
        self.map(context, &self.indices)
    }

    pub fn unmap(&self, context: &Context, region_memory: vk::DeviceMemory) {
        unsafe { context.device.unmap_memory(region_memory) };
    }

    pub fn vertex_memory(&self) -> vk::DeviceMemory {
        self.vertices.memory
    }

    pub fn index_memory(&self) -> vk::DeviceMemory {
        self.indices.memory
    }

    fn map(&self, context: &Context, region: &Region) -> Result<*mut u8> {
        check_map(self.resizing, self.profile, region.count)?;

        let size = region.count * region.stride;
        let pointer = unsafe {
            context.device
                .map_memory(region.memory, 0, size, vk::MemoryMapFlags::empty())?
        };
        Ok(pointer.cast())
    }

    pub fn destroy(&mut self, context: &Context) {
        destroy_region(context, &mut self.vertices);
        destroy_region(context, &mut self.indices);
        unsafe { context.device.destroy_command_pool(self.transfer_pool, None) };
    }
}

/// Maps are only valid on a host-visible store that holds data
/// and is not mid-resize. Checked before any device call so a
/// refused map leaves nothing mapped.
fn check_map(resizing: bool, profile: MemoryProfile, count: u64) -> Result<(), MapError> {
    if resizing {
        return Err(MapError::ResizeInFlight);
    }
    if profile == MemoryProfile::DeviceOnly {
        return Err(MapError::DeviceOnly);
    }
    if count == 0 {
        return Err(MapError::Empty);
    }
    Ok(())
}

/// A removed range must lie inside the region, or the count
/// arithmetic after compaction would no longer match the byte
/// sizes of the reallocated buffers.
fn check_range(offset: u64, count: u64, total: u64) -> Result<(), GeometryError> {
    if offset.checked_add(count).map_or(false, |end| end <= total) {
        Ok(())
    } else {
        Err(GeometryError::RangeOutOfBounds { offset, count, total })
    }
}

/// Appended data must be a whole number of elements, or the
/// buffer would be sized for bytes the element count cannot
/// account for.
fn check_data_len(len: u64, stride: u64) -> Result<(), GeometryError> {
    if len % stride == 0 {
        Ok(())
    } else {
        Err(GeometryError::MisalignedData { len, stride })
    }
}

/// The byte ranges that survive removing `count` elements at
/// `offset` from a region of `total` elements: the run before
/// the removed range and the run after it.
fn surviving_ranges(total: u64, offset: u64, count: u64, stride: u64) -> [(u64, u64); 2] {
    let front = (0, offset * stride);
    let back = (
        (offset + count) * stride,
        total.saturating_sub(offset + count) * stride,
    );
    [front, back]
}

/// Grows a region by `data`, carrying the old contents forward
/// on the device and staging only the new bytes in.
fn extend_region(
    context: &Context,
    pool: vk::CommandPool,
    profile: MemoryProfile,
    region: &mut Region,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    check_data_len(data.len() as u64, region.stride)?;

    let old_size = region.count * region.stride;
    let new_size = old_size + data.len() as u64;

    let usage = region.usage
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST;
    let (buffer, memory) = create_buffer(context, new_size, usage, profile.properties())?;

    if old_size > 0 {
        copy_buffer_region(context, pool, region.buffer, buffer, old_size, 0, 0)?;
    }

    let (staging, staging_memory) = create_buffer(
        context,
        data.len() as u64,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    fill_buffer(context, staging_memory, data)?;
    copy_buffer_region(context, pool, staging, buffer, data.len() as u64, 0, old_size)?;

    unsafe {
        context.device.destroy_buffer(staging, None);
        context.device.free_memory(staging_memory, None);
    }
    destroy_region(context, region);

    region.buffer = buffer;
    region.memory = memory;
    region.count += data.len() as u64 / region.stride;
    Ok(())
}

/// Shrinks a region by pulling the surviving byte ranges out to
/// host-visible staging, reallocating, and copying them back
/// contiguously. The device round trip keeps this correct for
/// device-only stores, where the survivors cannot be read from
/// the host.
fn shrink_region(
    context: &Context,
    pool: vk::CommandPool,
    profile: MemoryProfile,
    region: &mut Region,
    offset: u64,
    count: u64,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    check_range(offset, count, region.count)?;

    let ranges = surviving_ranges(region.count, offset, count, region.stride);
    let remaining: u64 = ranges.iter().map(|&(_, len)| len).sum();

    if remaining == 0 {
        destroy_region(context, region);
        region.count = 0;
        return Ok(());
    }

    let (staging, staging_memory) = create_buffer(
        context,
        remaining,
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    let mut cursor = 0;
    for &(src_offset, len) in &ranges {
        if len > 0 {
            copy_buffer_region(context, pool, region.buffer, staging, len, src_offset, cursor)?;
            cursor += len;
        }
    }

    let usage = region.usage
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST;
    let (buffer, memory) = create_buffer(context, remaining, usage, profile.properties())?;
    copy_buffer_region(context, pool, staging, buffer, remaining, 0, 0)?;

    unsafe {
        context.device.destroy_buffer(staging, None);
        context.device.free_memory(staging_memory, None);
    }
    destroy_region(context, region);

    region.buffer = buffer;
    region.memory = memory;
    region.count -= count;
    Ok(())
}

fn destroy_region(context: &Context, region: &mut Region) {
    if region.buffer != vk::Buffer::null() {
        unsafe {
            context.device.destroy_buffer(region.buffer, None);
            context.device.free_memory(region.memory, None);
        }
        region.buffer = vk::Buffer::null();
        region.memory = vk::DeviceMemory::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surviving_ranges_bracket_the_removed_run() {
        // 10 elements of 4 bytes; remove 3 at offset 2.
        let [front, back] = surviving_ranges(10, 2, 3, 4);
        assert_eq!(front, (0, 8));
        assert_eq!(back, (20, 20));

        let remaining: u64 = front.1 + back.1;
        assert_eq!(remaining, (10 - 3) * 4);
    }

    #[test]
    fn removing_the_head_leaves_only_the_tail() {
        let [front, back] = surviving_ranges(6, 0, 2, 2);
        assert_eq!(front, (0, 0));
        assert_eq!(back, (4, 8));
    }

    #[test]
    fn removing_the_tail_leaves_only_the_head() {
        let [front, back] = surviving_ranges(6, 4, 2, 2);
        assert_eq!(front, (0, 8));
        assert_eq!(back.1, 0);
    }

    #[test]
    fn removing_everything_leaves_nothing() {
        let ranges = surviving_ranges(5, 0, 5, 4);
        let remaining: u64 = ranges.iter().map(|&(_, len)| len).sum();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn range_past_the_end_is_rejected() {
        // 5 elements; removing 3 at offset 4 runs past the end.
        let err = check_range(4, 3, 5).unwrap_err();
        assert_eq!(
            err,
            GeometryError::RangeOutOfBounds {
                offset: 4,
                count: 3,
                total: 5
            }
        );

        assert!(check_range(4, 1, 5).is_ok());
        assert!(check_range(u64::MAX, 2, 5).is_err());
    }

    #[test]
    fn accepted_removals_keep_bytes_matching_counts() {
        let (total, stride) = (5, 4);
        for offset in 0..total {
            for count in 1..=(total - offset) {
                assert!(check_range(offset, count, total).is_ok());

                let ranges = surviving_ranges(total, offset, count, stride);
                let surviving_bytes: u64 = ranges.iter().map(|&(_, len)| len).sum();
                assert_eq!(surviving_bytes, (total - count) * stride);
            }
        }
    }

    #[test]
    fn partial_elements_are_rejected() {
        let err = check_data_len(10, 4).unwrap_err();
        assert_eq!(err, GeometryError::MisalignedData { len: 10, stride: 4 });

        assert!(check_data_len(12, 4).is_ok());
    }

    #[test]
    fn map_refusals_are_named() {
        assert_eq!(
            check_map(true, MemoryProfile::HostVisible, 4),
            Err(MapError::ResizeInFlight)
        );
        assert_eq!(
            check_map(false, MemoryProfile::DeviceOnly, 4),
            Err(MapError::DeviceOnly)
        );
        assert_eq!(
            check_map(false, MemoryProfile::HostVisible, 0),
            Err(MapError::Empty)
        );
        assert!(check_map(false, MemoryProfile::HostVisible, 4).is_ok());
    }
}
