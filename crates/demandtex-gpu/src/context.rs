//! GPU context management.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::backend::{BackendKind, DeviceBackend};
use crate::capabilities::GpuCapabilities;
use crate::command::CommandQueue;
use crate::error::{GpuError, Result};
use crate::memory::{Allocation, DevicePtr, MemHandle, MemoryUsage};
use crate::reference::ReferenceBackend;
use crate::vulkan::VulkanBackend;
use crate::texture::{TextureObject, TextureRecord};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Identity of a GPU context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Raw id value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "context#{}", self.0)
    }
}

/// Context current on the calling thread, if any.
pub fn current_context() -> Option<ContextId> {
    CURRENT_CONTEXT.with(Cell::get)
}

/// Verify that `expected` is current on the calling thread.
pub fn check_context(expected: ContextId) -> Result<()> {
    let actual = current_context();
    if actual == Some(expected) {
        Ok(())
    } else {
        Err(GpuError::ContextMismatch { expected, actual })
    }
}

/// A device context: memory, texture objects and queues share one context.
pub struct GpuContext {
    id: ContextId,
    capabilities: GpuCapabilities,
    backend: Arc<dyn DeviceBackend>,
    pub(crate) textures: RwLock<HashMap<TextureObject, Arc<RwLock<TextureRecord>>>>,
    next_texture: AtomicU64,
    next_queue: AtomicU64,
}

impl GpuContext {
    /// Get the context id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Get the device this context runs on.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub(crate) fn backend(&self) -> &dyn DeviceBackend {
        &*self.backend
    }

    pub(crate) fn next_texture_object(&self) -> TextureObject {
        TextureObject::from_raw(self.next_texture.fetch_add(1, Ordering::Relaxed))
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Bind this context to the calling thread.
    pub fn make_current(&self) {
        CURRENT_CONTEXT.with(|current| current.set(Some(self.id)));
    }

    /// Unbind whatever context is current on the calling thread.
    pub fn clear_current() {
        CURRENT_CONTEXT.with(|current| current.set(None));
    }

    /// Check whether this context is current on the calling thread.
    pub fn is_current(&self) -> bool {
        current_context() == Some(self.id)
    }

    /// Create a new in-order command queue.
    pub fn create_queue(&self, name: impl Into<String>) -> CommandQueue {
        let id = self.next_queue.fetch_add(1, Ordering::Relaxed);
        CommandQueue::new(self.id, id, name.into(), self.backend.timeline())
    }

    /// Current memory usage.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.backend.usage()
    }

    /// Copy `bytes` to a linear allocation.
    pub fn write_memory(&self, ptr: DevicePtr, bytes: &[u8]) -> Result<()> {
        self.backend.write_linear(ptr, bytes)
    }

    /// Copy `len` bytes out of a linear allocation.
    pub fn read_memory(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        self.backend.read_linear(ptr, len)
    }

    /// Copy `len` bytes out of a tile pool handle at `offset`.
    ///
    /// Tile pools on a Vulkan device are not host accessible.
    pub fn read_handle(&self, handle: MemHandle, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.backend.read_pool(handle, offset, len)
    }

    /// Copy `bytes` into an allocation at `offset`, whatever its kind.
    pub fn write_allocation(&self, allocation: Allocation, offset: usize, bytes: &[u8]) -> Result<()> {
        match allocation {
            Allocation::Pointer(ptr) => self.backend.write_linear(ptr.offset(offset), bytes),
            Allocation::Handle(handle) => self.backend.write_pool(handle, offset, bytes),
        }
    }

    /// Wait until every queue in `queues` has retired its work.
    pub fn synchronize(&self, queues: &[&CommandQueue]) -> Result<()> {
        queues.iter().try_for_each(|queue| queue.synchronize())
    }
}

/// Capabilities requested of the builder.
///
/// The reference device takes them as given. A Vulkan device can only be
/// restricted by them: features it lacks stay off and its memory budget
/// never exceeds the device-local heaps.
#[derive(Clone, Debug, Default)]
struct CapabilityOverrides {
    device_name: Option<String>,
    sparse_textures: Option<bool>,
    memory_pools: Option<bool>,
    device_memory: Option<u64>,
    tile_pool_granularity: Option<usize>,
    max_texture_dimension: Option<u32>,
}

impl CapabilityOverrides {
    fn replace_all(capabilities: GpuCapabilities) -> Self {
        Self {
            device_name: Some(capabilities.device_name),
            sparse_textures: Some(capabilities.supports_sparse_textures),
            memory_pools: Some(capabilities.supports_memory_pools),
            device_memory: Some(capabilities.device_memory_bytes),
            tile_pool_granularity: Some(capabilities.tile_pool_granularity),
            max_texture_dimension: Some(capabilities.max_texture_dimension),
        }
    }

    fn apply(self, mut capabilities: GpuCapabilities) -> GpuCapabilities {
        if let Some(name) = self.device_name {
            capabilities.device_name = name;
        }
        if let Some(enable) = self.sparse_textures {
            capabilities.supports_sparse_textures = enable;
        }
        if let Some(enable) = self.memory_pools {
            capabilities.supports_memory_pools = enable;
        }
        if let Some(bytes) = self.device_memory {
            capabilities.device_memory_bytes = bytes;
        }
        if let Some(bytes) = self.tile_pool_granularity {
            capabilities.tile_pool_granularity = bytes;
        }
        if let Some(extent) = self.max_texture_dimension {
            capabilities.max_texture_dimension = extent;
        }
        capabilities
    }

    fn restrict(self, mut capabilities: GpuCapabilities) -> GpuCapabilities {
        if let Some(name) = self.device_name {
            capabilities.device_name = name;
        }
        if let Some(enable) = self.sparse_textures {
            capabilities.supports_sparse_textures &= enable;
        }
        if let Some(enable) = self.memory_pools {
            capabilities.supports_memory_pools &= enable;
        }
        if let Some(bytes) = self.device_memory {
            capabilities.device_memory_bytes = capabilities.device_memory_bytes.min(bytes);
        }
        if let Some(bytes) = self.tile_pool_granularity {
            capabilities.tile_pool_granularity = bytes;
        }
        if let Some(extent) = self.max_texture_dimension {
            capabilities.max_texture_dimension = capabilities.max_texture_dimension.min(extent);
        }
        capabilities
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    backend: BackendKind,
    app_name: String,
    enable_validation: bool,
    overrides: CapabilityOverrides,
    make_current: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            backend: BackendKind::Reference,
            app_name: "demandtex".to_string(),
            enable_validation: cfg!(debug_assertions),
            overrides: CapabilityOverrides::default(),
            make_current: true,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the device to run on (default: the reference device).
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the application name reported to Vulkan.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable Vulkan validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Set the device name.
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.overrides.device_name = Some(name.into());
        self
    }

    /// Enable or disable sparse texture support.
    pub fn sparse_textures(mut self, enable: bool) -> Self {
        self.overrides.sparse_textures = Some(enable);
        self
    }

    /// Enable or disable queue-ordered memory pools.
    pub fn memory_pools(mut self, enable: bool) -> Self {
        self.overrides.memory_pools = Some(enable);
        self
    }

    /// Set the device memory budget.
    pub fn device_memory(mut self, bytes: u64) -> Self {
        self.overrides.device_memory = Some(bytes);
        self
    }

    /// Set the recommended tile pool granularity (0 for none).
    pub fn tile_pool_granularity(mut self, bytes: usize) -> Self {
        self.overrides.tile_pool_granularity = Some(bytes);
        self
    }

    /// Replace all capabilities.
    pub fn capabilities(mut self, capabilities: GpuCapabilities) -> Self {
        self.overrides = CapabilityOverrides::replace_all(capabilities);
        self
    }

    /// Whether to bind the new context to the building thread (default: yes).
    pub fn make_current(mut self, enable: bool) -> Self {
        self.make_current = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<Arc<GpuContext>> {
        let (capabilities, backend): (GpuCapabilities, Arc<dyn DeviceBackend>) = match self.backend {
            BackendKind::Reference => {
                let capabilities = self.overrides.apply(GpuCapabilities::default());
                let backend = Arc::new(ReferenceBackend::new(capabilities.device_memory_bytes));
                (capabilities, backend)
            }
            BackendKind::Vulkan => {
                let overrides = self.overrides;
                let backend = VulkanBackend::create(&self.app_name, self.enable_validation, |queried| {
                    overrides.restrict(queried)
                })?;
                (backend.capabilities().clone(), Arc::new(backend))
            }
        };

        if !capabilities.meets_requirements() {
            return Err(GpuError::UnsupportedFeature(format!(
                "device does not meet requirements: {}",
                capabilities.summary()
            )));
        }

        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        tracing::info!("Created {id} on the {} device: {}", self.backend, capabilities.summary());

        let context = Arc::new(GpuContext {
            id,
            capabilities,
            backend,
            textures: RwLock::new(HashMap::new()),
            next_texture: AtomicU64::new(1),
            next_queue: AtomicU64::new(1),
        });

        if self.make_current {
            context.make_current();
        }

        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_binds_context() {
        let context = GpuContextBuilder::new().build().unwrap();
        assert!(context.is_current());
        assert!(check_context(context.id()).is_ok());
    }

    #[test]
    fn second_context_takes_over_thread() {
        let first = GpuContextBuilder::new().build().unwrap();
        let second = GpuContextBuilder::new().build().unwrap();
        assert_ne!(first.id(), second.id());
        assert!(!first.is_current());

        let err = check_context(first.id()).unwrap_err();
        assert_eq!(
            err,
            GpuError::ContextMismatch {
                expected: first.id(),
                actual: Some(second.id()),
            }
        );

        first.make_current();
        assert!(check_context(first.id()).is_ok());
    }

    #[test]
    fn unbound_build() {
        GpuContext::clear_current();
        let context = GpuContextBuilder::new().make_current(false).build().unwrap();
        assert_eq!(current_context(), None);
        assert!(matches!(
            check_context(context.id()),
            Err(GpuError::ContextMismatch { actual: None, .. })
        ));
    }

    #[test]
    fn rejects_useless_device() {
        let result = GpuContextBuilder::new().device_memory(16).build();
        assert!(matches!(result, Err(GpuError::UnsupportedFeature(_))));
    }

    #[test]
    fn reference_is_the_default_backend() {
        let context = GpuContextBuilder::new().build().unwrap();
        assert_eq!(context.backend_kind(), BackendKind::Reference);
    }

    #[test]
    fn overrides_replace_or_restrict() {
        let overrides = CapabilityOverrides {
            sparse_textures: Some(true),
            device_memory: Some(64 << 20),
            ..CapabilityOverrides::default()
        };
        let queried = GpuCapabilities {
            supports_sparse_textures: false,
            device_memory_bytes: 32 << 20,
            ..GpuCapabilities::default()
        };

        let applied = overrides.clone().apply(queried.clone());
        assert!(applied.supports_sparse_textures);
        assert_eq!(applied.device_memory_bytes, 64 << 20);

        let restricted = overrides.restrict(queried);
        assert!(!restricted.supports_sparse_textures);
        assert_eq!(restricted.device_memory_bytes, 32 << 20);
    }
}
