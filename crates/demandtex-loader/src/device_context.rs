//! Residency-aware texture sampling for kernels.
//!
//! [`DemandLoader::launch_prepare`](crate::DemandLoader::launch_prepare)
//! snapshots the samplers and residency bits into a [`DeviceContext`] before
//! each launch. Kernels sample through it; every lookup that needs a page
//! which is not resident records the page in the launch's miss buffer.

use std::sync::Arc;

use demandtex_core::{MipLevelDims, TextureDescriptor, TextureId};
use demandtex_gpu::{Footprint, GpuContext, SparseProperties, TextureObject};
use glam::{Vec2, Vec4};
use parking_lot::Mutex;

use crate::demand_texture::TexturePages;

/// What a kernel needs to sample one texture.
#[derive(Clone, Debug)]
pub struct SamplerRecord {
    /// Device texture object
    pub texture_object: TextureObject,
    /// Sampling parameters
    pub descriptor: TextureDescriptor,
    /// Extent of every level
    pub levels: Vec<MipLevelDims>,
    /// Page layout of a sparse texture; `None` for dense textures
    pub sparse: Option<SparseSampler>,
}

/// Page layout of a sparse texture.
#[derive(Clone, Debug)]
pub struct SparseSampler {
    /// Tile geometry
    pub properties: SparseProperties,
    /// Relative page numbering
    pub pages: TexturePages,
    /// Page id of relative page 0
    pub first_page: u32,
}

/// One bit per page id.
///
/// Used both for residency and for the per-launch request bits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ResidencyBits {
    words: Vec<u64>,
}

impl ResidencyBits {
    pub(crate) fn get(&self, page: u32) -> bool {
        self.words
            .get(page as usize / 64)
            .is_some_and(|word| word & (1u64 << (page % 64)) != 0)
    }

    pub(crate) fn set(&mut self, page: u32) {
        let index = page as usize / 64;
        if index >= self.words.len() {
            self.words.resize(index + 1, 0);
        }
        self.words[index] |= 1u64 << (page % 64);
    }

    pub(crate) fn clear(&mut self, page: u32) {
        if let Some(word) = self.words.get_mut(page as usize / 64) {
            *word &= !(1u64 << (page % 64));
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

/// Distinct pages requested by one launch.
///
/// A page enters `pages` only the first time its request bit is set, so
/// repeated misses on the same page never use up capacity.
#[derive(Default)]
struct MissBuffer {
    requested: ResidencyBits,
    pages: Vec<u32>,
    dropped: usize,
}

/// Snapshot shared by every lookup of one launch.
pub(crate) struct LaunchState {
    context: Arc<GpuContext>,
    samplers: Vec<Option<SamplerRecord>>,
    resident: ResidencyBits,
    capacity: usize,
    misses: Mutex<MissBuffer>,
}

impl LaunchState {
    pub(crate) fn new(
        context: Arc<GpuContext>,
        samplers: Vec<Option<SamplerRecord>>,
        resident: ResidencyBits,
        capacity: usize,
    ) -> Self {
        Self {
            context,
            samplers,
            resident,
            capacity,
            misses: Mutex::new(MissBuffer::default()),
        }
    }

    fn record_miss(&self, page: u32) {
        let mut misses = self.misses.lock();
        if misses.requested.get(page) {
            return;
        }
        misses.requested.set(page);
        if misses.pages.len() < self.capacity {
            misses.pages.push(page);
        } else {
            misses.dropped += 1;
        }
    }
}

/// Per-launch residency context handed to kernels.
///
/// Cloning is cheap; clones share the launch's miss buffer.
#[derive(Clone, Default)]
pub struct DeviceContext {
    state: Option<Arc<LaunchState>>,
}

impl DeviceContext {
    /// Create an unprepared context. Every lookup fails until prepared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the context was prepared for a launch.
    pub fn is_prepared(&self) -> bool {
        self.state.is_some()
    }

    pub(crate) fn prepare(&mut self, state: LaunchState) {
        self.state = Some(Arc::new(state));
    }

    /// Drain the miss buffer.
    ///
    /// Returns the distinct pages recorded and the number of distinct pages
    /// dropped because the buffer was full.
    pub(crate) fn take_misses(&self) -> Option<(Vec<u32>, usize)> {
        let state = self.state.as_ref()?;
        let mut misses = state.misses.lock();
        let MissBuffer { pages, dropped, .. } = std::mem::take(&mut *misses);
        Some((pages, dropped))
    }

    /// Check whether `page` was resident when the launch was prepared.
    pub fn is_resident(&self, page: u32) -> bool {
        self.state.as_ref().is_some_and(|state| state.resident.get(page))
    }

    /// Number of distinct misses recorded so far.
    pub fn num_misses(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.misses.lock().pages.len())
    }

    /// Sample `texture` at `uv` with level of detail `lod`.
    ///
    /// Returns `None` when the texture or any page its footprint needs is not
    /// resident; those pages are recorded as misses.
    pub fn tex2d_lod(&self, texture: TextureId, uv: Vec2, lod: f32) -> Option<Vec4> {
        let state = self.state.as_ref()?;

        // The sampler page doubles as the texture id.
        let sampler_page = texture.0;
        let record = match state.samplers.get(texture.index()) {
            Some(Some(record)) if state.resident.get(sampler_page) => record,
            _ => {
                state.record_miss(sampler_page);
                return None;
            }
        };

        if let Some(sparse) = &record.sparse {
            let footprint = Footprint::compute(&record.descriptor, &record.levels, uv, lod);
            let mut missing: Vec<u32> = Vec::new();
            for tap in &footprint.taps {
                let region = sparse.properties.region_of(tap.level, tap.x, tap.y);
                let Some(relative) = sparse.pages.page_of(region) else {
                    continue;
                };
                let page = sparse.first_page + relative;
                if !state.resident.get(page) && !missing.contains(&page) {
                    missing.push(page);
                }
            }
            if !missing.is_empty() {
                missing.into_iter().for_each(|page| state.record_miss(page));
                return None;
            }
        }

        state.context.sample(record.texture_object, uv, lod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residency_bits() {
        let mut bits = ResidencyBits::default();
        assert!(!bits.get(1000));
        bits.set(1000);
        bits.set(3);
        assert!(bits.get(1000));
        assert!(bits.get(3));
        assert_eq!(bits.count(), 2);
        bits.clear(1000);
        bits.clear(5000);
        assert!(!bits.get(1000));
        assert_eq!(bits.count(), 1);
    }

    #[test]
    fn unprepared_context_misses_nothing() {
        let context = DeviceContext::new();
        assert!(!context.is_prepared());
        assert_eq!(context.tex2d_lod(TextureId(0), Vec2::ZERO, 0.0), None);
        assert_eq!(context.num_misses(), 0);
        assert!(context.take_misses().is_none());
    }

    fn prepared(capacity: usize) -> DeviceContext {
        let gpu = demandtex_gpu::GpuContextBuilder::new().build().unwrap();
        let mut context = DeviceContext::new();
        context.prepare(LaunchState::new(gpu, Vec::new(), ResidencyBits::default(), capacity));
        context
    }

    #[test]
    fn miss_buffer_overflows() {
        let context = prepared(2);
        for id in 0..3 {
            assert_eq!(context.tex2d_lod(TextureId(id), Vec2::ZERO, 0.0), None);
        }
        assert_eq!(context.num_misses(), 2);
        let (pages, dropped) = context.take_misses().unwrap();
        assert_eq!(pages, vec![0, 1]);
        assert_eq!(dropped, 1);
        assert_eq!(context.num_misses(), 0);
    }

    #[test]
    fn repeated_misses_use_one_slot() {
        let context = prepared(2);
        for _ in 0..100 {
            assert_eq!(context.tex2d_lod(TextureId(7), Vec2::ZERO, 0.0), None);
        }
        assert_eq!(context.tex2d_lod(TextureId(3), Vec2::ZERO, 0.0), None);
        assert_eq!(context.tex2d_lod(TextureId(3), Vec2::ONE, 0.0), None);

        let (pages, dropped) = context.take_misses().unwrap();
        assert_eq!(pages, vec![7, 3]);
        assert_eq!(dropped, 0);

        // Request bits start over with the drained buffer.
        assert_eq!(context.tex2d_lod(TextureId(7), Vec2::ZERO, 0.0), None);
        assert_eq!(context.take_misses().unwrap(), (vec![7], 0));
    }

    #[test]
    fn dropped_pages_are_counted_once() {
        let context = prepared(1);
        for _ in 0..10 {
            for id in 0..3 {
                let _ = context.tex2d_lod(TextureId(id), Vec2::ZERO, 0.0);
            }
        }
        assert_eq!(context.take_misses().unwrap(), (vec![0], 2));
    }
}
