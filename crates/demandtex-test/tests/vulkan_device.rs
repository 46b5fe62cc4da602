//! The request loop on a Vulkan device.
//!
//! Every test returns early on machines without a usable device, and the
//! sparse ones also when the device cannot bind sparse images.

use std::sync::Arc;

use demandtex_core::{Options, TextureDescriptor};
use demandtex_gpu::{BackendKind, DeviceAllocator, GpuContext, GpuContextBuilder, MemoryAllocator};
use demandtex_test::{checkerboard, DemandHarness};

fn vulkan_context() -> Option<Arc<GpuContext>> {
    match GpuContextBuilder::new()
        .backend(BackendKind::Vulkan)
        .app_name("demandtex-tests")
        .validation(false)
        .build()
    {
        Ok(context) => Some(context),
        Err(err) => {
            eprintln!("skipping: no Vulkan device ({err})");
            None
        }
    }
}

fn sparse_context() -> Option<Arc<GpuContext>> {
    let context = vulkan_context()?;
    if !context.capabilities().supports_sparse_textures {
        eprintln!("skipping: {} has no sparse residency", context.capabilities().device_name);
        return None;
    }
    Some(context)
}

fn render(context: Option<Arc<GpuContext>>, options: Options, lod: f32) -> (Vec<usize>, Vec<glam::Vec4>) {
    let mut harness = match context {
        Some(context) => DemandHarness::with_context(context, options, 16, 16).unwrap(),
        None => DemandHarness::new(options, 16, 16).unwrap(),
    };
    let id = harness
        .create_texture(checkerboard(256, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();
    let report = harness.render_until_resident(id, lod, 8).unwrap();
    (report.tasks_per_frame, report.texels)
}

#[test]
fn linear_memory_round_trips() {
    let Some(context) = vulkan_context() else {
        return;
    };
    assert_eq!(context.backend_kind(), BackendKind::Vulkan);

    let allocator = DeviceAllocator::new(Arc::clone(&context));
    let allocation = allocator.allocate(4096, None).unwrap();
    let ptr = allocation.as_ptr().unwrap();
    assert_eq!(context.read_memory(ptr, 16).unwrap(), vec![0; 16]);

    context.write_memory(ptr.offset(100), &[1, 2, 3]).unwrap();
    assert_eq!(context.read_memory(ptr.offset(99), 5).unwrap(), vec![0, 1, 2, 3, 0]);
    assert_eq!(context.memory_usage().device_bytes, 4096);

    allocator.free(allocation, None).unwrap();
    assert_eq!(context.memory_usage().device_bytes, 0);
}

#[test]
fn sparse_tiles_match_reference_device() {
    let Some(context) = sparse_context() else {
        return;
    };
    for lod in [0.0, 5.0] {
        let (tasks, texels) = render(Some(Arc::clone(&context)), Options::default(), lod);
        context.make_current();
        let (expected_tasks, expected) = render(None, Options::default(), lod);
        context.make_current();
        assert_eq!(tasks, expected_tasks, "lod {lod}");
        assert_eq!(texels, expected, "lod {lod}");
    }
}

#[test]
fn dense_textures_match_reference_device() {
    let Some(context) = vulkan_context() else {
        return;
    };
    let options = Options::default().with_sparse_textures(false);
    let (tasks, texels) = render(Some(Arc::clone(&context)), options.clone(), 0.0);
    let (expected_tasks, expected) = render(None, options, 0.0);
    assert_eq!(tasks, vec![1, 0]);
    assert_eq!(tasks, expected_tasks);
    assert_eq!(texels, expected);
}
