//! Page id assignment.
//!
//! Page ids `0..max_textures` are sampler pages: page `n` stands for the
//! sampler of texture `n`. Textures that need tile pages reserve a contiguous
//! range above that.

use demandtex_core::TextureId;
use hashbrown::HashMap;

use crate::error::{Error, Result};

/// A contiguous range of page ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageRange {
    /// First page id
    pub first: u32,
    /// Number of pages
    pub count: u32,
}

impl PageRange {
    /// Check whether `page` lies in the range.
    pub const fn contains(&self, page: u32) -> bool {
        page >= self.first && page - self.first < self.count
    }

    /// One past the last page id.
    pub const fn end(&self) -> u32 {
        self.first + self.count
    }
}

/// What a page id stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedPage {
    /// The sampler of a texture.
    Sampler(TextureId),
    /// A page of a texture, relative to the start of its range.
    Texture {
        /// Owning texture
        texture: TextureId,
        /// Page index within the texture's range
        relative_page: u32,
    },
}

/// Hands out page ranges and resolves page ids.
pub struct PageTableManager {
    max_textures: u32,
    max_pages: u32,
    next_page: u32,
    /// Reserved ranges in increasing page order.
    ranges: Vec<(PageRange, TextureId)>,
    by_texture: HashMap<TextureId, PageRange>,
}

impl PageTableManager {
    /// Create a page table with `max_pages` pages, the first `max_textures` of
    /// which are sampler pages.
    pub fn new(max_textures: u32, max_pages: u32) -> Result<Self> {
        if max_textures > max_pages {
            return Err(Error::InvalidOptions(format!(
                "{max_textures} textures do not fit in {max_pages} pages"
            )));
        }
        Ok(Self {
            max_textures,
            max_pages,
            next_page: max_textures,
            ranges: Vec::new(),
            by_texture: HashMap::new(),
        })
    }

    /// Number of sampler pages.
    pub const fn max_textures(&self) -> u32 {
        self.max_textures
    }

    /// One past the highest page id in use.
    pub const fn pages_in_use(&self) -> u32 {
        self.next_page
    }

    /// Pages still available for reservation.
    pub const fn available_pages(&self) -> u32 {
        self.max_pages - self.next_page
    }

    /// Reserve `count` pages for `texture`.
    pub fn reserve(&mut self, texture: TextureId, count: u32) -> Result<PageRange> {
        if let Some(range) = self.by_texture.get(&texture) {
            return Err(Error::InvalidState(format!(
                "{texture} already holds pages {}..{}",
                range.first,
                range.end()
            )));
        }
        if count > self.available_pages() {
            return Err(Error::PageTableFull {
                requested: count,
                available: self.available_pages(),
            });
        }

        let range = PageRange {
            first: self.next_page,
            count,
        };
        self.next_page += count;
        self.ranges.push((range, texture));
        self.by_texture.insert(texture, range);
        Ok(range)
    }

    /// Range reserved by `texture`, if any.
    pub fn range_of(&self, texture: TextureId) -> Option<PageRange> {
        self.by_texture.get(&texture).copied()
    }

    /// Resolve a page id.
    pub fn resolve(&self, page: u32) -> Option<ResolvedPage> {
        if page < self.max_textures {
            return Some(ResolvedPage::Sampler(TextureId(page)));
        }
        let index = self.ranges.partition_point(|(range, _)| range.end() <= page);
        let (range, texture) = self.ranges.get(index)?;
        range.contains(page).then_some(ResolvedPage::Texture {
            texture: *texture,
            relative_page: page - range.first,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_pages_come_first() {
        let table = PageTableManager::new(16, 1024).unwrap();
        assert_eq!(table.resolve(3), Some(ResolvedPage::Sampler(TextureId(3))));
        assert_eq!(table.resolve(16), None);
        assert_eq!(table.pages_in_use(), 16);
    }

    #[test]
    fn ranges_resolve_to_relative_pages() {
        let mut table = PageTableManager::new(16, 1024).unwrap();
        let a = table.reserve(TextureId(0), 21).unwrap();
        let b = table.reserve(TextureId(5), 4).unwrap();
        assert_eq!(a.first, 16);
        assert_eq!(b.first, 37);

        assert_eq!(
            table.resolve(36),
            Some(ResolvedPage::Texture { texture: TextureId(0), relative_page: 20 })
        );
        assert_eq!(
            table.resolve(37),
            Some(ResolvedPage::Texture { texture: TextureId(5), relative_page: 0 })
        );
        assert_eq!(table.resolve(41), None);
        assert_eq!(table.range_of(TextureId(5)), Some(b));
    }

    #[test]
    fn empty_ranges_are_skipped() {
        let mut table = PageTableManager::new(4, 64).unwrap();
        table.reserve(TextureId(0), 0).unwrap();
        let b = table.reserve(TextureId(1), 2).unwrap();
        assert_eq!(
            table.resolve(b.first),
            Some(ResolvedPage::Texture { texture: TextureId(1), relative_page: 0 })
        );
    }

    #[test]
    fn full_table() {
        let mut table = PageTableManager::new(4, 8).unwrap();
        table.reserve(TextureId(0), 3).unwrap();
        let err = table.reserve(TextureId(1), 2).unwrap_err();
        assert!(matches!(err, Error::PageTableFull { requested: 2, available: 1 }));
        assert!(matches!(table.reserve(TextureId(0), 1), Err(Error::InvalidState(_))));
        assert!(PageTableManager::new(8, 4).is_err());
    }
}
