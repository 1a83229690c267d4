//! Descriptor-set and sampler caching.
//!
//! A descriptor key is the full binding state of a draw: up to four texture
//! slots plus the sampler mode. At most one live set exists per key; pools
//! are fixed-budget and appended to, never individually freed, so set handles
//! stay valid until [`DescriptorCache::clear`].

use crate::device::DeviceContext;
use crate::error::*;
use crate::frame::FrameSubmitter;
use crate::pipeline::PolyFlags;
use ash::vk;
use snafu::ResultExt;
use std::collections::HashMap;
use tracing::{debug, info, trace};

use super::texture::TextureKey;

/// Texture slots per draw: base, lightmap, macro, detail.
pub const TEXTURE_SLOTS: usize = 4;

/// Sets per descriptor pool.
pub const SETS_PER_POOL: u32 = 1000;

const SAMPLER_NO_SMOOTH: u8 = 1 << 0;
const SAMPLER_CLAMP: u8 = 1 << 1;

/// Sampler-relevant bits of the polygon flags, packed for keying.
pub fn sampler_mode(flags: PolyFlags) -> u8 {
    let mut mode = 0;
    if flags.contains(PolyFlags::NO_SMOOTH) {
        mode |= SAMPLER_NO_SMOOTH;
    }
    if flags.contains(PolyFlags::CLAMP_UV) {
        mode |= SAMPLER_CLAMP;
    }
    mode
}

/// Complete binding state of one draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub textures: [Option<TextureKey>; TEXTURE_SLOTS],
    pub sampler_mode: u8,
}

/// True when `key` binds `texture` in any slot.
pub(crate) fn key_binds_texture(key: &DescriptorKey, texture: TextureKey) -> bool {
    key.textures.contains(&Some(texture))
}

/// Pool occupancy accounting, separated from the device objects so the
/// roll-over point is checkable on its own.
#[derive(Debug, Default)]
pub struct PoolBudget {
    allocated: u32,
}

impl PoolBudget {
    /// Registers one set allocation; true means the current pool is full and
    /// a fresh pool must be appended before allocating.
    pub fn register(&mut self) -> bool {
        let needs_pool = self.allocated % SETS_PER_POOL == 0;
        self.allocated += 1;
        needs_pool
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn reset(&mut self) {
        self.allocated = 0;
    }
}

pub struct DescriptorCache {
    set_layout: vk::DescriptorSetLayout,
    pools: Vec<vk::DescriptorPool>,
    budget: PoolBudget,
    sets: HashMap<DescriptorKey, vk::DescriptorSet>,
    samplers: HashMap<u8, vk::Sampler>,
    hits: u64,
    misses: u64,
}

impl DescriptorCache {
    pub fn new(device: &DeviceContext) -> Result<Self> {
        let bindings: Vec<_> = (0..TEXTURE_SLOTS as u32)
            .map(|slot| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(slot)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = unsafe {
            device.device.create_descriptor_set_layout(&layout_info, None)
        }
        .context(CreateResourceErr { what: "descriptor set layout" })?;

        Ok(DescriptorCache {
            set_layout,
            pools: Vec::new(),
            budget: PoolBudget::default(),
            sets: HashMap::new(),
            samplers: HashMap::new(),
            hits: 0,
            misses: 0,
        })
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Returns the set for `key`, allocating and writing it on first use.
    /// `views` must already have unused slots resolved to the null texture.
    #[profiling::function]
    pub fn get_or_create(
        &mut self,
        device: &DeviceContext,
        key: DescriptorKey,
        views: [vk::ImageView; TEXTURE_SLOTS],
    ) -> Result<vk::DescriptorSet> {
        if let Some(&set) = self.sets.get(&key) {
            self.hits += 1;
            return Ok(set);
        }
        self.misses += 1;

        if self.budget.register() {
            self.append_pool(device)?;
        }
        let pool = *self.pools.last().expect("pool appended above");

        let layouts = [self.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context(DescriptorAllocErr)?[0];

        let sampler = self.sampler(device, key.sampler_mode)?;
        let image_infos: Vec<_> = views
            .iter()
            .map(|&view| {
                [vk::DescriptorImageInfo::default()
                    .sampler(sampler)
                    .image_view(view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
            })
            .collect();
        let writes: Vec<_> = image_infos
            .iter()
            .enumerate()
            .map(|(slot, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(slot as u32)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(info)
            })
            .collect();

        unsafe { device.device.update_descriptor_sets(&writes, &[]) };

        trace!(?key, "allocated descriptor set");
        self.sets.insert(key, set);
        Ok(set)
    }

    fn append_pool(&mut self, device: &DeviceContext) -> Result<()> {
        debug!(
            "Appending descriptor pool #{} ({} sets each)",
            self.pools.len() + 1,
            SETS_PER_POOL,
        );

        let sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(SETS_PER_POOL * TEXTURE_SLOTS as u32)];
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&sizes);

        let pool = unsafe { device.device.create_descriptor_pool(&info, None) }
            .context(CreateResourceErr { what: "descriptor pool" })?;
        self.pools.push(pool);
        Ok(())
    }

    /// One sampler per (filter, addressing) pair, created on demand and kept
    /// for the cache's lifetime.
    fn sampler(&mut self, device: &DeviceContext, mode: u8) -> Result<vk::Sampler> {
        if let Some(&sampler) = self.samplers.get(&mode) {
            return Ok(sampler);
        }

        let filter = if mode & SAMPLER_NO_SMOOTH != 0 {
            vk::Filter::NEAREST
        } else {
            vk::Filter::LINEAR
        };
        let address = if mode & SAMPLER_CLAMP != 0 {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        } else {
            vk::SamplerAddressMode::REPEAT
        };

        let info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .anisotropy_enable(filter == vk::Filter::LINEAR)
            .max_anisotropy(if filter == vk::Filter::LINEAR { 4.0 } else { 1.0 })
            .max_lod(vk::LOD_CLAMP_NONE);

        let sampler = unsafe { device.device.create_sampler(&info, None) }
            .context(CreateResourceErr { what: "sampler" })?;
        self.samplers.insert(mode, sampler);
        Ok(sampler)
    }

    /// Drops cached sets that bind `texture` in any slot. Called when the
    /// texture's backing image is replaced: the sets still point at the old
    /// view and must never be handed out again. They stay allocated in their
    /// pool until [`DescriptorCache::clear`], which is cheap at the pool
    /// budgets involved.
    pub fn invalidate_texture(&mut self, texture: TextureKey) {
        let before = self.sets.len();
        self.sets.retain(|key, _| !key_binds_texture(key, texture));
        let dropped = before - self.sets.len();
        if dropped > 0 {
            debug!(?texture, dropped, "invalidated descriptor sets for replaced texture");
        }
    }

    /// Drops all sets and pools. Pools go through the delete list because the
    /// frame in flight may still reference sets from them.
    pub fn clear(&mut self, submitter: &mut FrameSubmitter) {
        info!(
            "Clearing {} descriptor sets across {} pools",
            self.sets.len(),
            self.pools.len(),
        );

        self.sets.clear();
        self.budget.reset();
        for pool in self.pools.drain(..) {
            submitter.delete_list_mut().push_descriptor_pool(pool);
        }
    }

    pub fn destroy(mut self, submitter: &mut FrameSubmitter) {
        self.clear(submitter);

        let device = submitter.device().clone();
        unsafe {
            for (_, sampler) in self.samplers.drain() {
                device.device.destroy_sampler(sampler, None);
            }
            device
                .device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_needs_a_pool() {
        let mut budget = PoolBudget::default();
        assert!(budget.register());
        assert_eq!(budget.allocated(), 1);
    }

    #[test]
    fn pool_rolls_over_exactly_at_its_budget() {
        let mut budget = PoolBudget::default();
        assert!(budget.register());
        for _ in 1..SETS_PER_POOL {
            assert!(!budget.register());
        }
        // Set 1001 lands in a fresh pool.
        assert!(budget.register());
        assert_eq!(budget.allocated(), SETS_PER_POOL + 1);
    }

    #[test]
    fn reset_restarts_the_accounting() {
        let mut budget = PoolBudget::default();
        budget.register();
        budget.register();
        budget.reset();
        assert!(budget.register());
    }

    #[test]
    fn sampler_mode_only_reflects_filter_and_addressing_bits() {
        assert_eq!(sampler_mode(PolyFlags::empty()), 0);
        assert_eq!(sampler_mode(PolyFlags::NO_SMOOTH), SAMPLER_NO_SMOOTH);
        assert_eq!(sampler_mode(PolyFlags::CLAMP_UV), SAMPLER_CLAMP);
        assert_eq!(
            sampler_mode(PolyFlags::NO_SMOOTH | PolyFlags::CLAMP_UV | PolyFlags::TRANSLUCENT),
            SAMPLER_NO_SMOOTH | SAMPLER_CLAMP,
        );
    }

    #[test]
    fn replaced_texture_matches_keys_binding_it_in_any_slot() {
        let mut minted: slotmap::SlotMap<TextureKey, ()> = slotmap::SlotMap::with_key();
        let replaced = minted.insert(());
        let untouched = minted.insert(());

        let mut textures = [None; TEXTURE_SLOTS];
        textures[2] = Some(replaced);
        let bound = DescriptorKey { textures, sampler_mode: 0 };
        let unbound = DescriptorKey {
            textures: [Some(untouched), None, None, None],
            sampler_mode: 0,
        };

        assert!(key_binds_texture(&bound, replaced));
        assert!(!key_binds_texture(&unbound, replaced));
    }

    #[test]
    fn keys_differ_when_any_slot_or_mode_differs() {
        let base = DescriptorKey {
            textures: [None; TEXTURE_SLOTS],
            sampler_mode: 0,
        };
        let clamped = DescriptorKey { sampler_mode: SAMPLER_CLAMP, ..base };
        assert_ne!(base, clamped);
        assert_eq!(base, DescriptorKey { ..base });
    }
}
