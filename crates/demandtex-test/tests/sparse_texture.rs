//! Filling sparse and dense textures by hand and sampling them with the
//! direct kernel.

use std::sync::Arc;

use approx::assert_relative_eq;
use demandtex_core::constants::NON_RESIDENT_SENTINEL;
use demandtex_core::{Options, TextureDescriptor, TextureId};
use demandtex_gpu::{CommandQueue, FillSource, GpuContext, GpuContextBuilder, TextureTileAllocator};
use demandtex_image::{CheckerBoardImage, Checkerboard, ImageSource, Pattern};
use demandtex_loader::{DemandTexture, TileBlockAllocator};
use demandtex_test::{launch_sparse_texture_kernel, red_channel, write_debug_image, OutputBuffer};
use glam::{UVec2, Vec4};

const S: f32 = NON_RESIDENT_SENTINEL;

struct Fixture {
    context: Arc<GpuContext>,
    queue: CommandQueue,
    tiles: TileBlockAllocator,
}

impl Fixture {
    fn new() -> Self {
        let context = GpuContextBuilder::new().build().unwrap();
        let queue = context.create_queue("sparse-test");
        let tiles = TileBlockAllocator::new(TextureTileAllocator::new(Arc::clone(&context)), 2 << 20, 0);
        Self { context, queue, tiles }
    }

    fn texture(&self, image: CheckerBoardImage) -> DemandTexture {
        let mut texture = DemandTexture::new(
            TextureId(0),
            TextureDescriptor::point_clamp(),
            Arc::new(image),
            Arc::clone(&self.context),
        );
        texture.open().unwrap();
        texture.init(&Options::default()).unwrap();
        texture
    }

    fn fill_tile(&mut self, texture: &DemandTexture, mip: u32, x: u32, y: u32) {
        let block = self.tiles.allocate_tile_block(DemandTexture::tile_buffer_size()).unwrap();
        let mut data = vec![0u8; DemandTexture::tile_buffer_size()];
        assert!(texture.read_tile(mip, x, y, &mut data).unwrap());
        texture
            .fill_tile(&self.queue, mip, x, y, FillSource::Host(&data), block.allocation, block.block.offset())
            .unwrap();
    }

    fn render(&self, texture: &DemandTexture, size: u32, lod: f32) -> Vec<Vec4> {
        let output = OutputBuffer::new(&self.context, size, size).unwrap();
        launch_sparse_texture_kernel(
            &self.queue,
            &self.context,
            texture.texture_object().unwrap(),
            output.grid(),
            lod,
        );
        self.queue.synchronize().unwrap();
        output.read().unwrap()
    }
}

#[test]
fn unfilled_tiles_sample_as_sentinel() {
    let fixture = Fixture::new();
    let texture = fixture.texture(CheckerBoardImage::new(256, 256, 4, true, true));
    assert!(texture.use_sparse_texture());

    let texels = fixture.render(&texture, 4, 0.0);
    assert!(texels.iter().all(|&texel| texel == Vec4::splat(S)));
}

#[test]
fn corner_tiles_of_checkerboard() {
    let mut fixture = Fixture::new();
    let texture = fixture.texture(CheckerBoardImage::new(256, 256, 4, true, true));
    assert_eq!((texture.tile_width(), texture.tile_height()), (64, 64));

    for (x, y) in [(0, 0), (0, 3), (3, 0), (3, 3)] {
        fixture.fill_tile(&texture, 0, x, y);
    }

    let texels = fixture.render(&texture, 4, 0.0);
    write_debug_image("corner_tiles", &texels, 4, 4).unwrap();
    assert_eq!(
        red_channel(&texels, 4),
        vec![
            vec![1.0, S, S, 0.0],
            vec![S, S, S, S],
            vec![S, S, S, S],
            vec![0.0, S, S, 1.0],
        ]
    );
}

#[test]
fn mip_tail_round_trip() {
    let mut fixture = Fixture::new();
    let image = CheckerBoardImage::new(256, 256, 4, true, true);
    let pattern = Checkerboard::new(4);
    let texture = fixture.texture(image);
    assert_eq!(texture.mip_tail_first_level(), 3);

    let mut data = vec![0u8; texture.mip_tail_size()];
    assert!(texture.read_mip_tail(&mut data).unwrap());
    let block = fixture.tiles.allocate_tile_block(texture.mip_tail_size()).unwrap();
    texture
        .fill_mip_tail(&fixture.queue, FillSource::Owned(data), block.allocation, block.block.offset())
        .unwrap();

    let texels = fixture.render(&texture, 4, 3.0);
    for (i, texel) in texels.iter().enumerate() {
        let (x, y) = (i % 4, i / 4);
        let lit = if (x + y) % 2 == 0 { 1.0 } else { 0.0 };
        assert_eq!(*texel, Vec4::new(0.0, lit, 0.0, 0.0), "pixel ({x}, {y})");
    }

    // Every tail level reproduces the source texel for texel.
    for level in 3..9 {
        let size = 256 >> level;
        let texels = fixture.render(&texture, size, level as f32);
        for (i, texel) in texels.iter().enumerate() {
            let (x, y) = (i as u32 % size, i as u32 / size);
            assert_eq!(*texel, pattern.texel(level, UVec2::splat(size), x, y), "level {level}");
        }
    }

    // Levels above the tail are still unbacked.
    let texels = fixture.render(&texture, 4, 0.0);
    assert!(texels.iter().all(|&texel| texel == Vec4::splat(S)));
}

#[test]
fn filled_tile_matches_source() {
    let mut fixture = Fixture::new();
    let pattern = Checkerboard::new(4);
    let texture = fixture.texture(CheckerBoardImage::new(256, 256, 4, true, true));
    fixture.fill_tile(&texture, 1, 1, 0);

    // Level 1 is 128 texels; tile (1, 0) covers x in 64..128, y in 0..64.
    let texels = fixture.render(&texture, 128, 1.0);
    for y in 0..64 {
        for x in 64..128 {
            let texel = texels[(y * 128 + x) as usize];
            assert_eq!(texel, pattern.texel(1, UVec2::splat(128), x, y));
        }
    }
    assert_eq!(texels[0], Vec4::splat(S));
}

#[test]
fn dense_small_texture() {
    let fixture = Fixture::new();
    let texture = fixture.texture(CheckerBoardImage::new(32, 32, 4, true, true));
    assert!(!texture.use_sparse_texture());
    assert_eq!(texture.num_pages(), 0);

    let mut data = vec![0u8; texture.mip_tail_size()];
    assert!(texture.read_mip_tail(&mut data).unwrap());
    texture
        .fill_dense_texture(&fixture.queue, FillSource::Host(&data), 32, 32)
        .unwrap();

    let texels = fixture.render(&texture, 4, 0.0);
    assert_eq!(
        red_channel(&texels, 4),
        vec![
            vec![1.0, 0.0, 1.0, 0.0],
            vec![0.0, 1.0, 0.0, 1.0],
            vec![1.0, 0.0, 1.0, 0.0],
            vec![0.0, 1.0, 0.0, 1.0],
        ]
    );
}

#[test]
fn dense_non_mipmapped_texture() {
    let fixture = Fixture::new();
    let texture = fixture.texture(CheckerBoardImage::new(256, 256, 4, false, false));
    assert!(!texture.use_sparse_texture());
    assert_eq!(texture.levels().len(), 1);

    let mut data = vec![0u8; 256 * 256 * 16];
    assert!(texture.read_non_mip_mapped_data(&mut data).unwrap());
    texture
        .fill_dense_texture(&fixture.queue, FillSource::Owned(data), 256, 256)
        .unwrap();

    let texels = fixture.render(&texture, 4, 0.0);
    for (i, texel) in texels.iter().enumerate() {
        let lit = if (i % 4 + i / 4) % 2 == 0 { 1.0 } else { 0.0 };
        assert_relative_eq!(texel.x, lit);
    }
}

#[test]
fn sparse_non_mipmapped_texture() {
    let mut fixture = Fixture::new();
    let texture = fixture.texture(CheckerBoardImage::new(256, 256, 4, false, true));
    assert!(texture.use_sparse_texture());
    assert_eq!(texture.num_pages(), 16);

    let mut tail = vec![0u8; texture.mip_tail_size().max(1)];
    assert!(!texture.read_mip_tail(&mut tail).unwrap());

    for y in 0..4 {
        for x in 0..4 {
            fixture.fill_tile(&texture, 0, x, y);
        }
    }

    let texels = fixture.render(&texture, 4, 0.0);
    for (i, texel) in texels.iter().enumerate() {
        let lit = if (i % 4 + i / 4) % 2 == 0 { 1.0 } else { 0.0 };
        assert_eq!(*texel, Vec4::new(lit, 0.0, 0.0, 0.0));
    }
}

#[test]
fn unmapped_tile_samples_as_sentinel() {
    let mut fixture = Fixture::new();
    let texture = fixture.texture(CheckerBoardImage::new(256, 256, 4, true, true));
    fixture.fill_tile(&texture, 0, 0, 0);
    assert_relative_eq!(fixture.render(&texture, 4, 0.0)[0].x, 1.0);

    texture.unmap_tile(&fixture.queue, 0, 0, 0).unwrap();
    assert_eq!(fixture.render(&texture, 4, 0.0)[0], Vec4::splat(S));
}

#[test]
fn reads_outside_tile_grid_are_refused() {
    let fixture = Fixture::new();
    let texture = fixture.texture(CheckerBoardImage::new(256, 256, 4, true, true));
    let mut data = vec![0u8; DemandTexture::tile_buffer_size()];

    assert!(!texture.read_tile(0, 4, 0, &mut data).unwrap());
    assert!(!texture.read_tile(0, 0, 4, &mut data).unwrap());
    assert!(!texture.read_tile(2, 1, 0, &mut data).unwrap());
    // Level 3 belongs to the mip tail.
    assert!(!texture.read_tile(3, 0, 0, &mut data).unwrap());
    assert!(texture.read_tile(2, 0, 0, &mut data).unwrap());
}

#[test]
fn image_info_survives_open() {
    let image = CheckerBoardImage::new(256, 128, 4, true, true);
    let info = image.open().unwrap();
    assert_eq!((info.width, info.height, info.num_mip_levels), (256, 128, 9));
    assert!(info.is_valid);
}

#[test]
fn fills_before_init_are_invalid() {
    let mut fixture = Fixture::new();
    let mut texture = DemandTexture::new(
        TextureId(0),
        TextureDescriptor::point_clamp(),
        Arc::new(CheckerBoardImage::new(256, 256, 4, true, true)),
        Arc::clone(&fixture.context),
    );
    texture.open().unwrap();

    let block = fixture.tiles.allocate_tile_block(DemandTexture::tile_buffer_size()).unwrap();
    let data = vec![0u8; DemandTexture::tile_buffer_size()];
    assert!(matches!(
        texture.fill_tile(&fixture.queue, 0, 0, 0, FillSource::Host(&data), block.allocation, 0),
        Err(demandtex_loader::Error::InvalidState(_))
    ));
    assert!(matches!(
        texture.fill_dense_texture(&fixture.queue, FillSource::Host(&data), 256, 256),
        Err(demandtex_loader::Error::InvalidState(_))
    ));
    assert_eq!(fixture.queue.pending_count(), 0);
}
