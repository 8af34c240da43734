// A set of helper structs for common operations
//
// Austin Shafer - 2024
pub mod timing;
#[macro_use]
pub mod logging;
pub mod log;
pub mod region;

use std::ops::Deref;
use std::slice;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};

/// Represents a raw pointer to a region of memory
/// containing an image buffer
///
/// *Does Not* free the memory when it is dropped. This
/// is used to represent shm buffers from wayland.
#[derive(Debug)]
pub struct MemImage {
    ptr: *const u8,
    /// size of the pixel elements, in bytes
    pub element_size: usize,
    pub width: usize,
    pub height: usize,
    /// The number of pixels between the start of one row and the
    /// next. Defaults to `width`, meaning the rows are tightly
    /// packed.
    pub stride: usize,
}

impl MemImage {
    pub fn new(ptr: *const u8, element_size: usize, width: usize, height: usize) -> MemImage {
        MemImage {
            ptr: ptr,
            element_size: element_size,
            width: width,
            height: height,
            stride: width,
        }
    }

    /// Sets the stride of this image to something besides the
    /// default tightly packed value. `stride` is in pixels.
    pub fn set_stride(&mut self, stride: usize) {
        assert!(stride >= self.width);
        self.stride = stride;
    }

    /// View the image as one contiguous byte slice.
    ///
    /// The slice covers the full stride of every row, since that is
    /// what texture upload with a row-length setting will read.
    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            panic!("Trying to dereference null pointer");
        }

        unsafe { slice::from_raw_parts(self.ptr, self.stride * self.height * self.element_size) }
    }
}

// WARNING
// While it is safe according to the language, it is not actually
// safe to use. The wayland thread and the render path share these,
// and the view is only valid until the backing wl_buffer is
// released.
unsafe impl Send for MemImage {}

impl Deref for MemImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::MemImage;

    #[test]
    fn mem_image_stride_slice() {
        // 2x2 image padded out to a stride of 4 pixels
        let pixels: Vec<u8> = (0..4 * 2 * 4).map(|i| i as u8).collect();
        let mut img = MemImage::new(pixels.as_ptr(), 4, 2, 2);
        assert_eq!(img.as_slice().len(), 2 * 2 * 4);

        img.set_stride(4);
        assert_eq!(img.as_slice().len(), 4 * 2 * 4);
        // second row starts a full stride in
        assert_eq!(img.as_slice()[4 * 4], 16);
    }
}
