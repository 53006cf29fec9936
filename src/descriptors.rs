use crate::{
    context::Context,
    error::{BindingError, InvalidFrameIndex},
};

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use vulkanalia::prelude::v1_0::*;
use anyhow::Result;
use log::*;

/// Kinds of resources a shader binding slot can name, as read
/// out of the shader's reflection data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
}

impl ResourceKind {
    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::UniformBuffer => "a uniform buffer",
            ResourceKind::StorageBuffer => "a storage buffer",
            ResourceKind::CombinedImageSampler => "a combined image sampler",
        }
    }

    fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            ResourceKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            ResourceKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            ResourceKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// A concrete resource attached to a binding slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum BoundResource {
    Buffer {
        kind: ResourceKind,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

impl BoundResource {
    fn kind(&self) -> ResourceKind {
        match self {
            BoundResource::Buffer { kind, .. } => *kind,
            BoundResource::Image { .. } => ResourceKind::CombinedImageSampler,
        }
    }
}

/// The full set of resources for one table, keyed by binding
/// slot. An ordered map so that the content hash does not depend
/// on insertion order.
pub type ResourceSet = BTreeMap<u32, BoundResource>;

/// One descriptor set per frame slot, all describing the same
/// resources. Per-slot sets let a table be rewritten for slot N
/// while slot N-1 is still in flight.
struct BindingTable {
    sets: Vec<vk::DescriptorSet>,
}

/// Owns the descriptor set layout, the pool, and the tables
/// allocated from it. Identical resource sets share one table:
/// lookup is by content hash, so binding the same resources
/// twice costs no new descriptors.
///
/// The pool starts sized for a single table and grows on demand;
/// growth migrates every live set into the new pool with
/// descriptor copies before the old pool is destroyed, so no
/// handle held by a recorded frame ever dangles.
pub struct ResourceBindingManager {
    layout: vk::DescriptorSetLayout,
    bindings: HashMap<u32, ResourceKind>,
    pool: vk::DescriptorPool,
    capacity: usize,
    tables: HashMap<u64, BindingTable>,
    slot_count: usize,
}

impl ResourceBindingManager {
    /// Builds the set layout from the shader's binding map and a
    /// pool with room for one table.
    pub fn new(
        context: &Context,
        shader_bindings: &HashMap<u32, ResourceKind>,
        slot_count: usize,
    ) -> Result<Self> {
        let layout = create_layout(context, shader_bindings)?;
        let pool = create_pool(context, shader_bindings, slot_count, 1)?;

        Ok(Self {
            layout,
            bindings: shader_bindings.clone(),
            pool,
            capacity: 1,
            tables: HashMap::new(),
            slot_count,
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Registers a resource set and returns its table id. The
    /// same resources (in any insertion order) always map to the
    /// same table.
    pub fn bind(&mut self, context: &Context, resources: &ResourceSet) -> Result<u64> {
        validate(&self.bindings, resources)?;

        let id = content_hash(resources);
        if self.tables.contains_key(&id) {
            return Ok(id);
        }

        if self.tables.len() == self.capacity {
            self.grow(context)?;
        }

        let sets = self.allocate_sets(context)?;
        for &set in &sets {
            write_set(context, set, resources);
        }

        self.tables.insert(id, BindingTable { sets });
        debug!("Binding table {:#018x} created ({} total).", id, self.tables.len());
        Ok(id)
    }

    /// The descriptor set to bind for `table` on frame slot
    /// `frame_index`. An index outside the slot count is a
    /// programmer error, never wrapped onto another slot.
    pub fn descriptor_set(&self, table: u64, frame_index: usize) -> Result<vk::DescriptorSet> {
        if frame_index >= self.slot_count {
            return Err(InvalidFrameIndex {
                index: frame_index,
                count: self.slot_count,
            }
            .into());
        }

        let entry = self
            .tables
            .get(&table)
            .ok_or(BindingError::UnknownTable(table))?;
        Ok(entry.sets[frame_index])
    }

    /// Replaces the pool with one sized for one more table and
    /// migrates every live descriptor set into it. The old pool
    /// is destroyed only after every copy has been issued, so
    /// sets referenced by in-flight frames stay valid for the
    /// whole operation.
    fn grow(&mut self, context: &Context) -> Result<()> {
        let new_capacity = self.tables.len() + 1;
        let new_pool = create_pool(context, &self.bindings, self.slot_count, new_capacity)?;

        let old_pool = self.pool;
        self.pool = new_pool;

        for table in self.tables.values_mut() {
            let fresh = allocate_from(context, self.pool, self.layout, self.slot_count)?;

            let copies: Vec<_> = table
                .sets
                .iter()
                .zip(&fresh)
                .flat_map(|(&src, &dst)| {
                    self.bindings.keys().map(move |&binding| {
                        vk::CopyDescriptorSet::builder()
                            .src_set(src)
                            .src_binding(binding)
                            .src_array_element(0)
                            .dst_set(dst)
                            .dst_binding(binding)
                            .dst_array_element(0)
                            .descriptor_count(1)
                            .build()
                    })
                })
                .collect();

            unsafe {
                context.device
                    .update_descriptor_sets(&[] as &[vk::WriteDescriptorSet], &copies);
            }

            table.sets = fresh;
        }

        unsafe { context.device.destroy_descriptor_pool(old_pool, None) };
        self.capacity = new_capacity;

        debug!("Descriptor pool regrown to {} tables.", new_capacity);
        Ok(())
    }

    fn allocate_sets(&self, context: &Context) -> Result<Vec<vk::DescriptorSet>> {
        allocate_from(context, self.pool, self.layout, self.slot_count)
    }

    pub fn destroy(&mut self, context: &Context) {
        unsafe {
            context.device.destroy_descriptor_pool(self.pool, None);
            context.device.destroy_descriptor_set_layout(self.layout, None);
        }
        self.tables.clear();
    }
}

/// Checks a resource set against the shader's binding map. The
/// errors are programmer errors: the calling code bound the
/// wrong resources and retrying cannot help.
fn validate(
    bindings: &HashMap<u32, ResourceKind>,
    resources: &ResourceSet,
) -> Result<(), BindingError> {
    for (&binding, resource) in resources {
        let expected = *bindings
            .get(&binding)
            .ok_or(BindingError::UnknownBinding(binding))?;
        let got = resource.kind();
        if got != expected {
            return Err(BindingError::KindMismatch {
                binding,
                expected: expected.name(),
                got: got.name(),
            });
        }
    }

    for &binding in bindings.keys() {
        if !resources.contains_key(&binding) {
            return Err(BindingError::UnboundResource(binding));
        }
    }

    Ok(())
}

/// Hash of the set's contents. The map's ordering makes this
/// independent of the order resources were attached in.
fn content_hash(resources: &ResourceSet) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (binding, resource) in resources {
        binding.hash(&mut hasher);
        resource.hash(&mut hasher);
    }
    hasher.finish()
}

fn create_layout(
    context: &Context,
    shader_bindings: &HashMap<u32, ResourceKind>,
) -> Result<vk::DescriptorSetLayout> {
    let mut ordered: Vec<_> = shader_bindings.iter().collect();
    ordered.sort_by_key(|(&binding, _)| binding);

    let bindings: Vec<_> = ordered
        .iter()
        .map(|(&binding, kind)| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(kind.descriptor_type())
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS)
                .build()
        })
        .collect();

    let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    Ok(unsafe { context.device.create_descriptor_set_layout(&info, None)? })
}

/// A pool with room for `table_capacity` tables of `slot_count`
/// sets each.
fn create_pool(
    context: &Context,
    shader_bindings: &HashMap<u32, ResourceKind>,
    slot_count: usize,
    table_capacity: usize,
) -> Result<vk::DescriptorPool> {
    let set_count = (slot_count * table_capacity) as u32;

    let mut per_kind: HashMap<vk::DescriptorType, u32> = HashMap::new();
    for kind in shader_bindings.values() {
        *per_kind.entry(kind.descriptor_type()).or_insert(0) += set_count;
    }

    let sizes: Vec<_> = per_kind
        .into_iter()
        .map(|(type_, count)| {
            vk::DescriptorPoolSize::builder()
                .type_(type_)
                .descriptor_count(count)
                .build()
        })
        .collect();

    let info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&sizes)
        .max_sets(set_count);

    Ok(unsafe { context.device.create_descriptor_pool(&info, None)? })
}

fn allocate_from(
    context: &Context,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    count: usize,
) -> Result<Vec<vk::DescriptorSet>> {
    let layouts = vec![layout; count];
    let info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    Ok(unsafe { context.device.allocate_descriptor_sets(&info)? })
}

fn write_set(context: &Context, set: vk::DescriptorSet, resources: &ResourceSet) {
    for (&binding, resource) in resources {
        match *resource {
            BoundResource::Buffer {
                kind,
                buffer,
                offset,
                range,
            } => {
                let info = vk::DescriptorBufferInfo::builder()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range);

                let buffer_info = &[info];
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding)
                    .dst_array_element(0)
                    .descriptor_type(kind.descriptor_type())
                    .buffer_info(buffer_info);

                unsafe {
                    context.device
                        .update_descriptor_sets(&[write], &[] as &[vk::CopyDescriptorSet]);
                }
            }
            BoundResource::Image {
                view,
                sampler,
                layout,
            } => {
                let info = vk::DescriptorImageInfo::builder()
                    .image_view(view)
                    .sampler(sampler)
                    .image_layout(layout);

                let image_info = &[info];
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(image_info);

                unsafe {
                    context.device
                        .update_descriptor_sets(&[write], &[] as &[vk::CopyDescriptorSet]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(offset: u64) -> BoundResource {
        BoundResource::Buffer {
            kind: ResourceKind::UniformBuffer,
            buffer: vk::Buffer::null(),
            offset,
            range: 256,
        }
    }

    fn shader_bindings() -> HashMap<u32, ResourceKind> {
        HashMap::from([
            (0, ResourceKind::UniformBuffer),
            (1, ResourceKind::CombinedImageSampler),
        ])
    }

    fn sampler() -> BoundResource {
        BoundResource::Image {
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    #[test]
    fn same_resources_hash_identically() {
        let set = ResourceSet::from([(0, uniform(0)), (1, sampler())]);
        assert_eq!(content_hash(&set), content_hash(&set.clone()));
    }

    #[test]
    fn attachment_order_does_not_change_the_hash() {
        let mut forward = ResourceSet::new();
        forward.insert(0, uniform(0));
        forward.insert(1, sampler());

        let mut backward = ResourceSet::new();
        backward.insert(1, sampler());
        backward.insert(0, uniform(0));

        assert_eq!(content_hash(&forward), content_hash(&backward));
    }

    #[test]
    fn different_contents_hash_differently() {
        let a = ResourceSet::from([(0, uniform(0)), (1, sampler())]);
        let b = ResourceSet::from([(0, uniform(512)), (1, sampler())]);
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn missing_binding_is_rejected() {
        let resources = ResourceSet::from([(0, uniform(0))]);
        let err = validate(&shader_bindings(), &resources).unwrap_err();
        assert!(matches!(err, BindingError::UnboundResource(1)));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let resources = ResourceSet::from([(0, sampler()), (1, sampler())]);
        let err = validate(&shader_bindings(), &resources).unwrap_err();
        assert!(matches!(
            err,
            BindingError::KindMismatch { binding: 0, .. }
        ));
    }

    fn handle_free_manager() -> ResourceBindingManager {
        ResourceBindingManager {
            layout: vk::DescriptorSetLayout::null(),
            bindings: shader_bindings(),
            pool: vk::DescriptorPool::null(),
            capacity: 1,
            tables: HashMap::new(),
            slot_count: 2,
        }
    }

    #[test]
    fn out_of_range_frame_index_is_rejected() {
        let manager = handle_free_manager();
        let err = manager.descriptor_set(0, 2).unwrap_err();
        assert_eq!(
            err.downcast_ref::<InvalidFrameIndex>(),
            Some(&InvalidFrameIndex { index: 2, count: 2 })
        );
    }

    #[test]
    fn unknown_table_is_rejected() {
        let manager = handle_free_manager();
        let err = manager.descriptor_set(42, 0).unwrap_err();
        assert_eq!(
            err.downcast_ref::<BindingError>(),
            Some(&BindingError::UnknownTable(42))
        );
    }

    #[test]
    fn unknown_binding_is_rejected() {
        let resources = ResourceSet::from([(0, uniform(0)), (1, sampler()), (7, uniform(0))]);
        let err = validate(&shader_bindings(), &resources).unwrap_err();
        assert!(matches!(err, BindingError::UnknownBinding(7)));
    }
}
