//! Hardware-addressable buffers and the handle type frames use to refer to them

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::utils::{lock, page_align};

/// Upper bound on buffers per pool, same as the V4L2 queue limit
pub const MAX_BUFFERS: usize = 32;

/// Pixel layouts the pipeline moves between stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Packed 10-bit Bayer from the sensor interface
    Raw10,
    /// Unpacked 16-bit Bayer
    Raw16,
    Nv12,
    Nv21,
    Yuyv,
    Rgb24,
}

impl PixelFormat {
    /// Per-plane byte sizes for a `width` x `height` image
    pub fn plane_sizes(self, width: u32, height: u32) -> Vec<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Raw10 => vec![(pixels * 5).div_ceil(4)],
            PixelFormat::Raw16 | PixelFormat::Yuyv => vec![pixels * 2],
            PixelFormat::Nv12 | PixelFormat::Nv21 => vec![pixels, pixels.div_ceil(2)],
            PixelFormat::Rgb24 => vec![pixels * 3],
        }
    }

    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            _ => 1,
        }
    }

    pub fn is_bayer(self) -> bool {
        matches!(self, PixelFormat::Raw10 | PixelFormat::Raw16)
    }
}

/// Reference from a frame to a pool slot.
///
/// A slot either refers to nothing or owns exactly one checked-out index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferHandle {
    #[default]
    None,
    Owned(usize),
}

impl BufferHandle {
    pub fn index(self) -> Option<usize> {
        match self {
            BufferHandle::None => None,
            BufferHandle::Owned(index) => Some(index),
        }
    }

    pub fn is_owned(self) -> bool {
        matches!(self, BufferHandle::Owned(_))
    }

    /// Move the index out, leaving `None` behind
    pub fn take(&mut self) -> Option<usize> {
        std::mem::take(self).index()
    }
}

/// One memory plane of a buffer
pub struct Plane {
    size: usize,
    map: Mutex<MmapMut>,
}

impl Plane {
    pub(crate) fn map(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "plane size must be non-zero",
            ));
        }
        let map = MmapMut::map_anon(page_align(size))?;
        Ok(Self {
            size,
            map: Mutex::new(map),
        })
    }

    /// Logical size requested for this plane
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes actually mapped (page aligned)
    pub fn mapped_len(&self) -> usize {
        lock(&self.map).len()
    }

    /// Raw address of the mapping, handed to devices that DMA into it
    pub fn addr(&self) -> usize {
        lock(&self.map).as_ptr() as usize
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut map = lock(&self.map);
        f(&mut map[..self.size])
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let map = lock(&self.map);
        f(&map[..self.size])
    }

    /// Copy the plane out for consumers outside the pipeline
    pub fn to_bytes(&self) -> Bytes {
        self.read(Bytes::copy_from_slice)
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane").field("size", &self.size).finish()
    }
}

/// A checked-out view of one pool slot. Cloning shares the same memory.
#[derive(Clone)]
pub struct Buffer {
    index: usize,
    manager: Arc<str>,
    planes: Arc<[Plane]>,
}

impl Buffer {
    pub(crate) fn new(index: usize, manager: Arc<str>, planes: Arc<[Plane]>) -> Self {
        Self {
            index,
            manager,
            planes,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Name of the manager the buffer belongs to
    pub fn manager(&self) -> &str {
        &self.manager
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, plane: usize) -> Option<&Plane> {
        self.planes.get(plane)
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn total_size(&self) -> usize {
        self.planes.iter().map(Plane::size).sum()
    }

    pub(crate) fn shares_memory_with(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.planes, &other.planes)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("manager", &self.manager)
            .field("index", &self.index)
            .field("planes", &self.planes.len())
            .finish()
    }
}
