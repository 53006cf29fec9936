use crate::context::Context;

use std::fs;
use std::path::{Path, PathBuf};

use vulkanalia::prelude::v1_0::*;
use anyhow::Result;
use log::*;

/// A pipeline cache persisted to disk between runs. The blob is
/// opaque and unversioned; the driver validates it on load and
/// simply starts over from an empty cache when it does not
/// match, so an unreadable or stale file is never an error.
pub struct PipelineCache {
    cache: vk::PipelineCache,
    path: PathBuf,
}

impl PipelineCache {
    pub fn open(context: &Context, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let blob = match fs::read(&path) {
            Ok(blob) => {
                debug!("Pipeline cache loaded ({} bytes).", blob.len());
                blob
            }
            Err(_) => Vec::new(),
        };

        let info = vk::PipelineCacheCreateInfo::builder().initial_data(&blob);
        let cache = unsafe { context.device.create_pipeline_cache(&info, None)? };

        Ok(Self { cache, path })
    }

    pub fn handle(&self) -> vk::PipelineCache {
        self.cache
    }

    /// Writes the cache back to its file. A failed write only
    /// costs the next run its warm start, so it is logged and
    /// swallowed.
    pub fn save(&self, context: &Context) {
        let blob = match unsafe { context.device.get_pipeline_cache_data(self.cache) } {
            Ok(blob) => blob,
            Err(code) => {
                warn!("Could not read pipeline cache back: {:?}.", code);
                return;
            }
        };

        if let Err(err) = fs::write(&self.path, &blob) {
            warn!("Could not persist pipeline cache: {}.", err);
        } else {
            debug!("Pipeline cache saved ({} bytes).", blob.len());
        }
    }

    pub fn destroy(&self, context: &Context) {
        unsafe { context.device.destroy_pipeline_cache(self.cache, None) };
    }
}

/// A pipeline layout over the binding manager's descriptor set
/// layout. No push constant ranges: per-draw data travels in
/// uniform buffers bound through the tables.
pub fn create_pipeline_layout(
    context: &Context,
    set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    let set_layouts = &[set_layout];
    let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);

    Ok(unsafe { context.device.create_pipeline_layout(&info, None)? })
}
