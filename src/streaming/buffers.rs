//! Scratch buffers for compute dispatches
//!
//! Instead of allocating fresh storage for every density upload and surface
//! readback, the [`RecyclingBufferPool`] keeps released buffers in
//! power-of-two size classes per usage and hands them out again. Buffers are
//! owned outright by whoever holds the [`BufferHandle`], so an in-flight
//! dispatch has exclusive access until it gives the handle back.

use std::collections::HashMap;

use bytemuck::Pod;

/// What a scratch buffer holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Density,
    Materials,
    Vertices,
    Indices,
}

/// Typed request: `count` elements of `element_size` bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub count: usize,
    pub element_size: usize,
    pub usage: BufferUsage,
}

impl BufferDesc {
    pub fn of<T: Pod>(count: usize, usage: BufferUsage) -> Self {
        Self {
            count,
            element_size: std::mem::size_of::<T>(),
            usage,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.count * self.element_size
    }
}

/// Exclusively owned scratch storage
///
/// Backed by 32-bit words so every element type up to 4-byte alignment can
/// be viewed in place.
#[derive(Debug)]
pub struct BufferHandle {
    id: u64,
    desc: BufferDesc,
    class_bytes: usize,
    words: Vec<u32>,
}

impl BufferHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> BufferDesc {
        self.desc
    }

    /// Bytes reserved, at least the requested length
    pub fn capacity(&self) -> usize {
        self.class_bytes
    }

    /// The requested bytes
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.desc.byte_len()]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.desc.byte_len();
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..len]
    }

    /// View the contents as `T`
    ///
    /// # Panics
    /// If `T` does not match the element size the buffer was requested with.
    pub fn read<T: Pod>(&self) -> &[T] {
        bytemuck::cast_slice(self.bytes())
    }

    pub fn read_mut<T: Pod>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.bytes_mut())
    }

    /// Copy `values` to the start of the buffer, returning how many fit
    pub fn write<T: Pod>(&mut self, values: &[T]) -> usize {
        let dst = self.read_mut::<T>();
        let n = values.len().min(dst.len());
        dst[..n].copy_from_slice(&values[..n]);
        n
    }
}

/// Buffer pool usage counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub requests: u64,
    /// Requests served from pooled storage
    pub reused: u64,
    pub released: u64,
    /// Handles requested and not yet released
    pub outstanding: u64,
    pub in_use_bytes: u64,
    pub pooled_bytes: u64,
}

/// Allocate/release contract for scratch buffers
pub trait BufferPool: Send {
    fn request(&mut self, desc: BufferDesc) -> BufferHandle;

    fn release(&mut self, handle: BufferHandle);

    fn stats(&self) -> BufferStats;
}

/// Smallest size class in bytes
const MIN_CLASS_BYTES: usize = 256;

/// Free buffers kept per (usage, class) bucket
const MAX_POOLED_PER_CLASS: usize = 32;

/// Power-of-two bucketed buffer recycler
#[derive(Debug, Default)]
pub struct RecyclingBufferPool {
    free: HashMap<(BufferUsage, usize), Vec<Vec<u32>>>,
    next_id: u64,
    stats: BufferStats,
}

impl RecyclingBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte size of the class that holds `bytes`
    pub fn class_for(bytes: usize) -> usize {
        bytes.max(MIN_CLASS_BYTES).next_power_of_two()
    }

    /// Free buffers across all classes
    pub fn pooled(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }
}

impl BufferPool for RecyclingBufferPool {
    fn request(&mut self, desc: BufferDesc) -> BufferHandle {
        let class_bytes = Self::class_for(desc.byte_len());
        self.stats.requests += 1;
        self.stats.outstanding += 1;
        self.stats.in_use_bytes += class_bytes as u64;

        let words = match self.free.get_mut(&(desc.usage, class_bytes)).and_then(Vec::pop) {
            Some(mut words) => {
                self.stats.reused += 1;
                self.stats.pooled_bytes -= class_bytes as u64;
                words.fill(0);
                words
            }
            None => vec![0u32; class_bytes / 4],
        };

        self.next_id += 1;
        log::trace!("Buffer {} requested: {:?} in {} byte class", self.next_id, desc, class_bytes);
        BufferHandle {
            id: self.next_id,
            desc,
            class_bytes,
            words,
        }
    }

    fn release(&mut self, handle: BufferHandle) {
        let class_bytes = handle.class_bytes;
        self.stats.released += 1;
        self.stats.outstanding = self.stats.outstanding.saturating_sub(1);
        self.stats.in_use_bytes = self.stats.in_use_bytes.saturating_sub(class_bytes as u64);

        let bucket = self.free.entry((handle.desc.usage, class_bytes)).or_default();
        if bucket.len() < MAX_POOLED_PER_CLASS {
            bucket.push(handle.words);
            self.stats.pooled_bytes += class_bytes as u64;
        }
    }

    fn stats(&self) -> BufferStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::surface::MeshVertex;

    #[test]
    fn test_size_classes() {
        assert_eq!(RecyclingBufferPool::class_for(0), 256);
        assert_eq!(RecyclingBufferPool::class_for(256), 256);
        assert_eq!(RecyclingBufferPool::class_for(257), 512);
        assert_eq!(RecyclingBufferPool::class_for(100_000), 131_072);
    }

    #[test]
    fn test_release_then_reuse_same_class() {
        let mut pool = RecyclingBufferPool::new();
        let a = pool.request(BufferDesc::of::<f32>(1000, BufferUsage::Density));
        assert_eq!(a.capacity(), 4096);
        pool.release(a);
        assert_eq!(pool.pooled(), 1);

        // Same class, different count
        let b = pool.request(BufferDesc::of::<f32>(900, BufferUsage::Density));
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.pooled(), 0);

        // Other usage never shares storage
        let c = pool.request(BufferDesc::of::<f32>(1000, BufferUsage::Vertices));
        assert_eq!(pool.stats().reused, 1);

        pool.release(b);
        pool.release(c);
        let stats = pool.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.in_use_bytes, 0);
        assert_eq!(stats.pooled_bytes, 8192);
    }

    #[test]
    fn test_typed_views() {
        let mut pool = RecyclingBufferPool::new();
        let mut buffer = pool.request(BufferDesc::of::<MeshVertex>(3, BufferUsage::Vertices));
        let vertex = MeshVertex { position: [1.0, 2.0, 3.0], normal: [0.0, 1.0, 0.0] };
        assert_eq!(buffer.write(&[vertex; 5]), 3);
        assert_eq!(buffer.read::<MeshVertex>(), &[vertex; 3]);
        assert_eq!(buffer.bytes().len(), 72);

        pool.release(buffer);
        let reused = pool.request(BufferDesc::of::<u32>(18, BufferUsage::Vertices));
        assert!(reused.read::<u32>().iter().all(|w| *w == 0));
    }
}
