//! In-process reference device.
//!
//! Linear memory, tile pools and dense images live in host vectors. Work
//! finishes as soon as it is issued, so the timeline never lags.

use std::collections::BTreeMap;
use std::sync::Arc;

use demandtex_core::geometry::align_up;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::backend::{BackendKind, Binding, DeviceBackend, DeviceTimeline};
use crate::error::{GpuError, Result};
use crate::memory::{DevicePtr, MemHandle, MemoryBudget, MemorySpace, MemoryUsage};
use crate::texture::{self, ImageLayout, SparseProperties, SparseRegion, TextureObject, TextureRecord};

const BASE_ADDRESS: u64 = 0x1_0000;
const ADDRESS_ALIGNMENT: usize = 256;

struct Region {
    space: MemorySpace,
    data: Vec<u8>,
}

struct MemoryStore {
    regions: BTreeMap<u64, Region>,
    handles: HashMap<u64, Vec<u8>>,
    images: HashMap<TextureObject, Vec<u8>>,
    budget: MemoryBudget,
    next_address: u64,
    next_handle: u64,
}

impl MemoryStore {
    fn locate(&self, ptr: DevicePtr, len: usize) -> Result<(u64, usize)> {
        let (&base, region) = self
            .regions
            .range(..=ptr.raw())
            .next_back()
            .ok_or(GpuError::InvalidAddress(ptr.raw()))?;
        let start = (ptr.raw() - base) as usize;
        if start + len > region.data.len() {
            return Err(GpuError::InvalidAddress(ptr.raw()));
        }
        Ok((base, start))
    }

    fn linear(&self, ptr: DevicePtr, len: usize) -> Result<&[u8]> {
        if len == 0 {
            return Ok(&[]);
        }
        let (base, start) = self.locate(ptr, len)?;
        Ok(&self.regions[&base].data[start..start + len])
    }

    fn linear_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8]> {
        if len == 0 {
            return Ok(&mut [][..]);
        }
        let (base, start) = self.locate(ptr, len)?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(GpuError::InvalidAddress(ptr.raw()))?;
        Ok(&mut region.data[start..start + len])
    }

    fn handle_range(&self, handle: MemHandle, offset: usize, len: usize) -> Result<&[u8]> {
        let data = self
            .handles
            .get(&handle.raw())
            .ok_or(GpuError::InvalidHandle(handle.raw()))?;
        data.get(offset..offset + len).ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "range {offset}+{len} outside tile pool of {} bytes",
                data.len()
            ))
        })
    }

    fn handle_range_mut(&mut self, handle: MemHandle, offset: usize, len: usize) -> Result<&mut [u8]> {
        let data = self
            .handles
            .get_mut(&handle.raw())
            .ok_or(GpuError::InvalidHandle(handle.raw()))?;
        let size = data.len();
        data.get_mut(offset..offset + len).ok_or_else(|| {
            GpuError::InvalidArgument(format!("range {offset}+{len} outside tile pool of {size} bytes"))
        })
    }

    fn image(&self, object: TextureObject) -> Result<&[u8]> {
        self.images
            .get(&object)
            .map(Vec::as_slice)
            .ok_or(GpuError::InvalidTexture(object.raw()))
    }
}

/// Timeline of a device whose work is done when issued.
struct Immediate;

impl DeviceTimeline for Immediate {
    fn submitted(&self) -> u64 {
        0
    }

    fn completed(&self) -> Result<u64> {
        Ok(0)
    }

    fn wait(&self, _value: u64) -> Result<()> {
        Ok(())
    }
}

/// Device model backed by process memory.
pub(crate) struct ReferenceBackend {
    store: Mutex<MemoryStore>,
    timeline: Arc<Immediate>,
}

impl ReferenceBackend {
    pub(crate) fn new(device_budget: u64) -> Self {
        Self {
            store: Mutex::new(MemoryStore {
                regions: BTreeMap::new(),
                handles: HashMap::new(),
                images: HashMap::new(),
                budget: MemoryBudget::new(device_budget),
                next_address: BASE_ADDRESS,
                next_handle: 1,
            }),
            timeline: Arc::new(Immediate),
        }
    }
}

impl DeviceBackend for ReferenceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Reference
    }

    fn usage(&self) -> MemoryUsage {
        self.store.lock().budget.usage()
    }

    fn timeline(&self) -> Arc<dyn DeviceTimeline> {
        self.timeline.clone()
    }

    fn allocate_linear(&self, space: MemorySpace, size: usize) -> Result<DevicePtr> {
        if size == 0 {
            return Ok(DevicePtr::NULL);
        }
        let mut store = self.store.lock();
        store.budget.add_linear(space, size)?;

        let address = store.next_address;
        // Leave a gap so that overruns never land in the next region.
        store.next_address += (align_up(size, ADDRESS_ALIGNMENT) + ADDRESS_ALIGNMENT) as u64;
        store.regions.insert(
            address,
            Region {
                space,
                data: vec![0; size],
            },
        );
        Ok(DevicePtr::from_raw(address))
    }

    fn free_linear(&self, ptr: DevicePtr) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut store = self.store.lock();
        let region = store
            .regions
            .remove(&ptr.raw())
            .ok_or(GpuError::InvalidAddress(ptr.raw()))?;
        store.budget.remove_linear(region.space, region.data.len());
        Ok(())
    }

    fn read_linear(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        Ok(self.store.lock().linear(ptr, len)?.to_vec())
    }

    fn write_linear(&self, ptr: DevicePtr, bytes: &[u8]) -> Result<()> {
        self.store.lock().linear_mut(ptr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    fn fill_linear(&self, ptr: DevicePtr, value: u8, len: usize) -> Result<()> {
        self.store.lock().linear_mut(ptr, len)?.fill(value);
        Ok(())
    }

    fn create_pool(&self, size: usize) -> Result<MemHandle> {
        if size == 0 {
            return Err(GpuError::InvalidArgument("empty tile pool".into()));
        }
        let mut store = self.store.lock();
        store.budget.add_pool(size)?;
        let handle = store.next_handle;
        store.next_handle += 1;
        store.handles.insert(handle, vec![0; size]);
        Ok(MemHandle::from_raw(handle))
    }

    fn release_pool(&self, handle: MemHandle) -> Result<()> {
        let mut store = self.store.lock();
        let data = store
            .handles
            .remove(&handle.raw())
            .ok_or(GpuError::InvalidHandle(handle.raw()))?;
        store.budget.remove_pool(data.len());
        Ok(())
    }

    fn read_pool(&self, handle: MemHandle, offset: usize, len: usize) -> Result<Vec<u8>> {
        Ok(self.store.lock().handle_range(handle, offset, len)?.to_vec())
    }

    fn write_pool(&self, handle: MemHandle, offset: usize, bytes: &[u8]) -> Result<()> {
        self.store
            .lock()
            .handle_range_mut(handle, offset, bytes.len())?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn sparse_properties(&self, layout: &ImageLayout) -> Result<SparseProperties> {
        texture::standard_sparse_properties(layout)
    }

    fn create_image(&self, object: TextureObject, layout: &ImageLayout, sparse: Option<&SparseProperties>) -> Result<()> {
        if sparse.is_some() {
            return Ok(());
        }
        let size = layout.chain_size();
        let mut store = self.store.lock();
        store.budget.charge(size)?;
        store.images.insert(object, vec![0; size]);
        Ok(())
    }

    fn destroy_image(&self, object: TextureObject, _record: &TextureRecord) -> Result<()> {
        let mut store = self.store.lock();
        if let Some(data) = store.images.remove(&object) {
            store.budget.release(data.len());
        }
        Ok(())
    }

    fn bind_region(
        &self,
        _object: TextureObject,
        _record: &TextureRecord,
        _region: SparseRegion,
        binding: Binding,
        size: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let mut store = self.store.lock();
        store.handle_range(binding.handle, binding.offset, size)?;
        store
            .handle_range_mut(binding.handle, binding.offset, bytes.len())?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn unbind_region(&self, _object: TextureObject, _record: &TextureRecord, _region: SparseRegion) -> Result<()> {
        Ok(())
    }

    fn write_image(&self, object: TextureObject, _record: &TextureRecord, bytes: &[u8]) -> Result<()> {
        let mut store = self.store.lock();
        let image = store
            .images
            .get_mut(&object)
            .ok_or(GpuError::InvalidTexture(object.raw()))?;
        let target = image.get_mut(..bytes.len()).ok_or_else(|| {
            GpuError::InvalidArgument(format!("{} bytes exceed the image", bytes.len()))
        })?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    fn read_texel(
        &self,
        object: TextureObject,
        record: &TextureRecord,
        region: Option<SparseRegion>,
        offset: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let store = self.store.lock();
        let bytes = match region {
            Some(region) => {
                let binding = record.binding(region).ok_or(GpuError::InvalidTexture(object.raw()))?;
                store.handle_range(binding.handle, binding.offset + offset, out.len())?
            }
            None => store
                .image(object)?
                .get(offset..offset + out.len())
                .ok_or_else(|| GpuError::InvalidArgument(format!("texel at {offset} outside the image")))?,
        };
        out.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_regions_are_separated() {
        let backend = ReferenceBackend::new(1 << 20);
        let a = backend.allocate_linear(MemorySpace::Device, 100).unwrap();
        let b = backend.allocate_linear(MemorySpace::Device, 100).unwrap();
        assert!(b.raw() >= a.raw() + 100 + ADDRESS_ALIGNMENT as u64);

        backend.write_linear(a.offset(96), &[1, 2, 3, 4]).unwrap();
        assert!(backend.write_linear(a.offset(98), &[1, 2, 3, 4]).is_err());
        assert_eq!(backend.read_linear(a.offset(96), 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.read_linear(b, 4).unwrap(), vec![0; 4]);

        backend.free_linear(a).unwrap();
        assert_eq!(backend.free_linear(a), Err(GpuError::InvalidAddress(a.raw())));
        assert_eq!(backend.usage().device_bytes, 100);
    }

    #[test]
    fn released_pool_is_an_invalid_handle() {
        let backend = ReferenceBackend::new(1 << 20);
        let handle = backend.create_pool(1 << 16).unwrap();
        backend.write_pool(handle, 10, &[5; 6]).unwrap();
        assert_eq!(backend.read_pool(handle, 10, 6).unwrap(), vec![5; 6]);

        backend.release_pool(handle).unwrap();
        assert_eq!(backend.read_pool(handle, 0, 1), Err(GpuError::InvalidHandle(handle.raw())));
        assert_eq!(backend.usage().num_handles, 0);
    }
}
