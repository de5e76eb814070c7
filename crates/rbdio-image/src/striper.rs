//! Image to object extent mapping
//!
//! Images are divided into fixed-size objects. The data area starts after
//! the crypto header, so area offsets are shifted by the header size before
//! mapping.
//!
//! ```text
//! Image (raw offsets)
//! ├── Object 0:  bytes 0 - 4MB       → rbd_data.{id}.0000000000000000
//! ├── Object 1:  bytes 4MB - 8MB     → rbd_data.{id}.0000000000000001
//! │   ...
//! └── Object N:  ...                 → rbd_data.{id}.{N:016x}
//! ```

use rbdio_common::{Error, Extent, Result};

/// Object number within an image
pub type ObjectNo = u64;

/// A byte range within one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectExtent {
    pub object_no: ObjectNo,
    /// Byte offset within the object
    pub offset: u64,
    pub length: u64,
    /// Area offset the range maps back to
    pub image_offset: u64,
    /// Position within the request's concatenated buffer
    pub buffer_offset: u64,
}

/// Maps area extents onto objects
#[derive(Debug, Clone, Copy)]
pub struct Striper {
    object_size: u64,
}

impl Striper {
    pub fn new(object_order: u8) -> Self {
        Self {
            object_size: 1u64 << object_order,
        }
    }

    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    /// Objects needed to hold `size` bytes
    pub fn object_count(&self, size: u64) -> u64 {
        size.div_ceil(self.object_size)
    }

    /// Map one extent starting `base` bytes into the image
    ///
    /// `buffer_offset` is the position of the extent's first byte in the
    /// request buffer. Fails if the extent ends past the 64-bit address space.
    pub fn extent_to_objects(
        &self,
        base: u64,
        extent: Extent,
        buffer_offset: u64,
    ) -> Result<Vec<ObjectExtent>> {
        if extent.is_empty() {
            return Ok(Vec::new());
        }

        let end = base
            .checked_add(extent.offset)
            .and_then(|start| start.checked_add(extent.length))
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "extent {}~{} overflows the image address space",
                    extent.offset, extent.length
                ))
            })?;
        let start = base + extent.offset;
        let first = start / self.object_size;
        let last = (end - 1) / self.object_size;

        let mut out = Vec::with_capacity((last - first + 1) as usize);
        for object_no in first..=last {
            let object_start = object_no * self.object_size;
            let range_start = start.max(object_start);
            let range_end = end.min(object_start.saturating_add(self.object_size));
            out.push(ObjectExtent {
                object_no,
                offset: range_start - object_start,
                length: range_end - range_start,
                image_offset: range_start - base,
                buffer_offset: buffer_offset + (range_start - start),
            });
        }
        Ok(out)
    }

    /// Map a list of extents, assigning consecutive buffer positions
    pub fn extents_to_objects(&self, base: u64, extents: &[Extent]) -> Result<Vec<ObjectExtent>> {
        let mut buffer_offset = 0;
        let mut out = Vec::new();
        for extent in extents {
            out.extend(self.extent_to_objects(base, *extent, buffer_offset)?);
            buffer_offset += extent.length;
        }
        Ok(out)
    }
}
