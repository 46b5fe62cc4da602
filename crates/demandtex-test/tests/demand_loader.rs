//! The per-frame request loop end to end.

use std::sync::Arc;

use approx::assert_relative_eq;
use ash::vk;
use demandtex_core::constants::{NON_RESIDENT_SENTINEL, TILE_SIZE_IN_BYTES};
use demandtex_core::{Options, TextureDescriptor};
use demandtex_gpu::{GpuContext, GpuContextBuilder};
use demandtex_image::{FileImage, MandelbrotImage};
use demandtex_loader::{DeviceContext, Error, TextureState};
use demandtex_test::{checkerboard, launch_texture_draw_kernel, write_debug_image, DemandHarness, OutputBuffer, Viewport};
use glam::Vec4;

fn is_checker(texels: &[Vec4], width: usize, squares: usize) {
    for (i, texel) in texels.iter().enumerate() {
        let (x, y) = (i % width, i / width);
        let lit = (x * squares / width + y * squares / width) % 2 == 0;
        let expected = if lit { Vec4::new(1.0, 0.0, 0.0, 0.0) } else { Vec4::ZERO };
        assert_eq!(*texel, expected, "pixel ({x}, {y})");
    }
}

#[test]
fn tasks_follow_distinct_misses() {
    let mut harness = DemandHarness::new(Options::default(), 16, 16).unwrap();
    let id = harness
        .create_texture(checkerboard(256, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();

    // Sampler first, then every level 0 tile, then nothing.
    let report = harness.render_until_resident(id, 0.0, 8).unwrap();
    assert_eq!(report.tasks_per_frame, vec![1, 16, 0]);
    is_checker(&report.texels, 16, 4);

    let (_, tasks) = harness.frame(id, 0.0).unwrap();
    assert_eq!(tasks, 0);

    let stats = harness.loader().statistics();
    assert_eq!(stats.num_tiles_filled, 16);
    assert_eq!(stats.num_requests_processed, 17);
    assert_eq!(stats.tile_blocks.blocks_in_use, 16);
    assert_eq!(stats.num_resident_pages, 17);
}

#[test]
fn first_frame_samples_sentinel() {
    let mut harness = DemandHarness::new(Options::default(), 4, 4).unwrap();
    let id = harness
        .create_texture(checkerboard(256, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();

    assert_eq!(harness.loader().texture(id).unwrap().state(), TextureState::Closed);
    let (texels, tasks) = harness.frame(id, 0.0).unwrap();
    assert_eq!(tasks, 1);
    assert!(texels.iter().all(|&texel| texel == Vec4::splat(NON_RESIDENT_SENTINEL)));
    assert_eq!(harness.loader().texture(id).unwrap().state(), TextureState::Initialized);
}

#[test]
fn small_texture_loads_in_one_request() {
    let mut harness = DemandHarness::new(Options::default(), 32, 32).unwrap();
    let id = harness
        .create_texture(checkerboard(32, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();

    let report = harness.render_until_resident(id, 0.0, 4).unwrap();
    assert_eq!(report.tasks_per_frame, vec![1, 0]);
    is_checker(&report.texels, 32, 4);
    assert!(!harness.loader().texture(id).unwrap().use_sparse_texture());
    assert_eq!(harness.loader().statistics().num_dense_textures_filled, 1);
}

#[test]
fn mip_tail_loads_as_one_page() {
    let mut harness = DemandHarness::new(Options::default(), 8, 8).unwrap();
    let id = harness
        .create_texture(checkerboard(256, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();

    let report = harness.render_until_resident(id, 5.0, 4).unwrap();
    assert_eq!(report.tasks_per_frame, vec![1, 1, 0]);
    assert_eq!(harness.loader().statistics().num_mip_tails_filled, 1);
    assert_eq!(harness.loader().statistics().num_tiles_filled, 0);
    // Level 5 is 8x8: the pixel grid lines up with its texels.
    let blue = Vec4::new(0.0, 0.0, 1.0, 0.0);
    assert_eq!(report.texels[0], blue);
    assert_eq!(report.texels[2], Vec4::ZERO);
}

#[test]
fn dense_and_sparse_sample_identically() {
    let linear = TextureDescriptor::default().with_filter(vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR);
    let render = |options: Options, lod: f32| {
        let mut harness = DemandHarness::new(options, 24, 24).unwrap();
        let id = harness.create_texture(checkerboard(256, 8, true, true), linear).unwrap();
        let report = harness.render_until_resident(id, lod, 8).unwrap();
        let sparse = harness.loader().texture(id).unwrap().use_sparse_texture();
        (report.texels, sparse)
    };

    for lod in [0.0, 1.5, 4.0] {
        let (sparse_texels, sparse) = render(Options::default(), lod);
        let (dense_texels, dense_is_sparse) = render(Options::default().with_sparse_textures(false), lod);
        assert!(sparse);
        assert!(!dense_is_sparse);
        for (a, b) in sparse_texels.iter().zip(&dense_texels) {
            assert_relative_eq!(a.x, b.x, epsilon = 1e-6);
            assert_relative_eq!(a.y, b.y, epsilon = 1e-6);
            assert_relative_eq!(a.z, b.z, epsilon = 1e-6);
        }
    }
}

#[test]
fn device_without_sparse_support_falls_back_to_dense() {
    let context = GpuContextBuilder::new().sparse_textures(false).build().unwrap();
    let mut harness = DemandHarness::with_context(context, Options::default(), 16, 16).unwrap();
    let id = harness
        .create_texture(checkerboard(256, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();

    let report = harness.render_until_resident(id, 0.0, 4).unwrap();
    assert_eq!(report.tasks_per_frame, vec![1, 0]);
    is_checker(&report.texels, 16, 4);
}

#[test]
fn non_mipmapped_texture_loads_dense() {
    let mut harness = DemandHarness::new(Options::default(), 4, 4).unwrap();
    let id = harness
        .create_texture(checkerboard(256, 4, false, false), TextureDescriptor::point_clamp())
        .unwrap();

    let report = harness.render_until_resident(id, 0.0, 4).unwrap();
    assert_eq!(report.tasks_per_frame, vec![1, 0]);
    is_checker(&report.texels, 4, 4);
}

#[test]
fn unload_forces_reload() {
    let mut harness = DemandHarness::new(Options::default(), 16, 16).unwrap();
    let id = harness
        .create_texture(checkerboard(256, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();
    harness.render_until_resident(id, 0.0, 8).unwrap();

    let queue = harness.queue().clone();
    assert_eq!(harness.loader_mut().unload_texture_tiles(&queue, id).unwrap(), 16);
    queue.synchronize().unwrap();
    assert_eq!(harness.loader_mut().release_completed_blocks().unwrap(), 16);
    assert_eq!(harness.loader().statistics().tile_blocks.blocks_in_use, 0);

    let (texels, tasks) = harness.frame(id, 0.0).unwrap();
    assert_eq!(tasks, 16);
    assert!(texels.iter().all(|&texel| texel == Vec4::splat(NON_RESIDENT_SENTINEL)));

    let report = harness.render_until_resident(id, 0.0, 4).unwrap();
    assert_eq!(report.tasks_per_frame, vec![0]);
    is_checker(&report.texels, 16, 4);
}

#[test]
fn overflowing_miss_buffer_still_converges() {
    let options = Options::default().with_max_requests_per_launch(4);
    let mut harness = DemandHarness::new(options, 16, 16).unwrap();
    let id = harness
        .create_texture(checkerboard(256, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();

    let report = harness.render_until_resident(id, 0.0, 32).unwrap();
    assert!(report.frames() > 3);
    assert!(report.tasks_per_frame[..report.frames() - 1].iter().all(|&tasks| tasks > 0));
    is_checker(&report.texels, 16, 4);

    let stats = harness.loader().statistics();
    assert!(stats.num_requests_dropped > 0);
    assert_eq!(stats.num_tiles_filled, 16);
}

#[test]
fn tile_pool_exhaustion_is_out_of_memory() {
    let context = GpuContextBuilder::new()
        .tile_pool_granularity(TILE_SIZE_IN_BYTES)
        .build()
        .unwrap();
    let options = Options::default().with_max_tile_pool_memory(2 * TILE_SIZE_IN_BYTES);
    let mut harness = DemandHarness::with_context(context, options, 16, 16).unwrap();
    let id = harness
        .create_texture(checkerboard(256, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();

    harness.frame(id, 0.0).unwrap();
    assert!(matches!(harness.frame(id, 0.0), Err(demandtex_test::TestError::Loader(Error::OutOfMemory { .. }))));
}

#[test]
fn wrong_context_is_rejected() {
    let mut harness = DemandHarness::new(Options::default(), 4, 4).unwrap();
    let id = harness
        .create_texture(checkerboard(32, 4, true, true), TextureDescriptor::point_clamp())
        .unwrap();

    let other = GpuContextBuilder::new().build().unwrap();
    assert!(matches!(
        harness.frame(id, 0.0),
        Err(demandtex_test::TestError::Loader(Error::ContextMismatch { .. }))
    ));

    harness.context().make_current();
    let report = harness.render_until_resident(id, 0.0, 4).unwrap();
    assert_eq!(report.tasks_per_frame, vec![1, 0]);
    drop(other);
}

#[test]
fn loader_requires_current_context() {
    let context = GpuContextBuilder::new().make_current(false).build().unwrap();
    GpuContext::clear_current();
    assert!(matches!(
        demandtex_loader::DemandLoader::new(context, Options::default()),
        Err(Error::ContextMismatch { actual: None, .. })
    ));
}

#[test]
fn missing_file_is_unsupported() {
    let mut harness = DemandHarness::new(Options::default(), 4, 4).unwrap();
    let id = harness
        .create_texture(
            Arc::new(FileImage::new("does/not/exist.png")),
            TextureDescriptor::point_clamp(),
        )
        .unwrap();
    assert!(matches!(
        harness.frame(id, 0.0),
        Err(demandtex_test::TestError::Loader(Error::UnsupportedFormat(_)))
    ));
}

#[test]
fn draw_kernel_covers_every_texture() {
    let mut harness = DemandHarness::new(Options::default(), 32, 32).unwrap();
    let textures = vec![
        harness
            .create_texture(checkerboard(256, 4, true, true), TextureDescriptor::point_clamp())
            .unwrap(),
        harness
            .create_texture(Arc::new(MandelbrotImage::new(256, 256, 64)), TextureDescriptor::default())
            .unwrap(),
        harness
            .create_texture(checkerboard(32, 2, true, true), TextureDescriptor::point_clamp())
            .unwrap(),
    ];

    let context = Arc::clone(harness.context());
    let queue = harness.queue().clone();
    let output = OutputBuffer::new(&context, 32, 32).unwrap();
    let mut device_context = DeviceContext::new();
    let viewport = Viewport {
        base_lod: 3.0,
        ..Viewport::default()
    };

    let mut frames = 0;
    loop {
        harness.loader_mut().launch_prepare(&queue, &mut device_context).unwrap();
        launch_texture_draw_kernel(&queue, &context, &device_context, &textures, output.grid(), viewport);
        let ticket = harness.loader_mut().process_requests(&queue, &device_context).unwrap();
        ticket.wait().unwrap();
        frames += 1;
        if ticket.num_tasks_total() == 0 || frames == 8 {
            break;
        }
    }
    assert!(frames < 8);

    let texels = output.read().unwrap();
    write_debug_image("draw_kernel", &texels, 32, 32).unwrap();
    // Two columns of 16 pixels; the fourth cell has no texture.
    let cell = |cx: usize, cy: usize| texels[(cy * 16 + 8) * 32 + cx * 16 + 8];
    for texel in [cell(0, 0), cell(1, 0), cell(0, 1)] {
        assert_ne!(texel, Vec4::splat(NON_RESIDENT_SENTINEL));
    }
    assert_eq!(cell(1, 1), Vec4::splat(NON_RESIDENT_SENTINEL));
    assert_eq!(harness.loader().statistics().num_textures, 3);
}

#[test]
fn large_viewport_requests_every_tile_once() {
    // 16384 pixels miss 256 distinct tiles; the miss buffer holds 8192 entries.
    let mut harness = DemandHarness::new(Options::default(), 128, 128).unwrap();
    let id = harness
        .create_texture(checkerboard(1024, 16, true, true), TextureDescriptor::point_clamp())
        .unwrap();

    let report = harness.render_until_resident(id, 0.0, 10).unwrap();
    assert_eq!(report.tasks_per_frame, vec![1, 256, 0]);
    is_checker(&report.texels, 128, 16);

    let stats = harness.loader().statistics();
    assert_eq!(stats.num_requests_dropped, 0);
    assert_eq!(stats.num_tiles_filled, 256);
}

#[test]
fn linear_draw_loads_each_page_once() {
    let mut harness = DemandHarness::new(Options::default(), 4, 4).unwrap();
    let linear = TextureDescriptor::default().with_filter(vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR);
    let textures = [harness.create_texture(checkerboard(1024, 16, true, true), linear).unwrap()];

    let context = Arc::clone(harness.context());
    let queue = harness.queue().clone();
    let output = OutputBuffer::new(&context, 150, 150).unwrap();
    let mut device_context = DeviceContext::new();

    let mut tasks_per_frame = Vec::new();
    while tasks_per_frame.len() < 10 {
        harness.loader_mut().launch_prepare(&queue, &mut device_context).unwrap();
        launch_texture_draw_kernel(&queue, &context, &device_context, &textures, output.grid(), Viewport::default());
        let ticket = harness.loader_mut().process_requests(&queue, &device_context).unwrap();
        ticket.wait().unwrap();
        tasks_per_frame.push(ticket.num_tasks_total());
        if ticket.num_tasks_total() == 0 {
            break;
        }
    }

    assert_eq!(tasks_per_frame, vec![1, 256, 0]);
    assert_eq!(tasks_per_frame.iter().sum::<usize>(), 257);
    let texels = output.read().unwrap();
    assert!(texels.iter().all(|&texel| texel != Vec4::splat(NON_RESIDENT_SENTINEL)));

    let stats = harness.loader().statistics();
    assert_eq!(stats.num_requests_processed, 257);
    assert_eq!(stats.num_requests_dropped, 0);
}
