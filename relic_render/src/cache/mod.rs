//! GPU-resident resource caching: textures, samplers, descriptor sets.
//!
//! The draw path funnels through [`ResourceCache::descriptor_for_draw`],
//! which resolves texture keys to views (unused slots fall back to the null
//! texture) and reuses the per-key descriptor set.

mod descriptor;
mod texture;

pub use descriptor::{sampler_mode, DescriptorCache, DescriptorKey, PoolBudget, SETS_PER_POOL, TEXTURE_SLOTS};
pub use texture::{ContentId, SourceFormat, TextureCache, TextureKey, TextureSync, TextureUpload};

use crate::error::*;
use crate::frame::FrameSubmitter;
use crate::pipeline::PolyFlags;
use ash::vk;
use tracing::debug;

pub struct ResourceCache {
    textures: TextureCache,
    descriptors: DescriptorCache,
}

impl ResourceCache {
    pub fn new(submitter: &mut FrameSubmitter) -> Result<Self> {
        let textures = TextureCache::new(submitter)?;
        let descriptors = DescriptorCache::new(submitter.device())?;
        Ok(ResourceCache { textures, descriptors })
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptors.set_layout()
    }

    /// Synchronizes one texture with the asset layer's current content. When
    /// the backing image is swapped out, descriptor sets binding the key are
    /// dropped so no draw samples the retired view.
    pub fn sync_texture(
        &mut self,
        submitter: &mut FrameSubmitter,
        upload: &TextureUpload,
    ) -> Result<TextureKey> {
        let synced = self.textures.sync(submitter, upload)?;
        if synced.replaced {
            self.descriptors.invalidate_texture(synced.key);
        }
        Ok(synced.key)
    }

    pub fn uv_scale(&self, key: TextureKey) -> [f32; 2] {
        self.textures.uv_scale(key)
    }

    /// The descriptor set binding `textures` with the sampler mode derived
    /// from `flags`. Unbound slots read the 1×1 white null texture.
    pub fn descriptor_for_draw(
        &mut self,
        submitter: &mut FrameSubmitter,
        textures: [Option<TextureKey>; TEXTURE_SLOTS],
        flags: PolyFlags,
    ) -> Result<vk::DescriptorSet> {
        let key = DescriptorKey {
            textures,
            sampler_mode: sampler_mode(flags),
        };

        let null_view = self
            .textures
            .view(self.textures.null_texture())
            .expect("null texture exists for the cache's lifetime");
        let views = textures.map(|slot| {
            slot.and_then(|key| self.textures.view(key)).unwrap_or(null_view)
        });

        self.descriptors
            .get_or_create(submitter.device(), key, views)
    }

    /// Drops all cached state. The contract is level-transition shaped: the
    /// caller must not reuse old [`TextureKey`]s afterwards, and the frame in
    /// flight drains via the delete list before anything is destroyed.
    #[profiling::function]
    pub fn clear(&mut self, submitter: &mut FrameSubmitter) {
        debug!(
            texture_hits = self.textures.hits(),
            texture_misses = self.textures.misses(),
            descriptor_hits = self.descriptors.hits(),
            descriptor_misses = self.descriptors.misses(),
            "cache statistics at clear",
        );

        // Sets reference texture views; they go first.
        self.descriptors.clear(submitter);
        self.textures.clear(submitter);
    }

    pub fn destroy(self, submitter: &mut FrameSubmitter) {
        self.descriptors.destroy(submitter);
        self.textures.destroy(submitter);
    }
}
