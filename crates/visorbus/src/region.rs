use crate::errors::ChannelError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

/// A block of memory shared with another partition.
///
/// SAFETY & MEMORY ORDERING:
///
/// The peer writes into this memory concurrently, so the region never hands
/// out `&mut` references. Plain byte copies are used for data whose ownership
/// is decided by a cursor (signal slots, payloads), and `Atomic*` references
/// for the cursors and state words themselves. Callers establish
/// happens-before through Release stores / Acquire loads on those atomics.
pub struct SharedRegion {
    mmap: MmapMut,
    base: *mut u8,
    len: usize,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create or open a backing file, growing it to `len` bytes if undersized.
    ///
    /// Existing content is left untouched; channel creators initialise the
    /// header themselves.
    pub fn create(path: impl AsRef<Path>, len: usize) -> Result<Self, ChannelError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // Only resize if the file is smaller than needed
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }

        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self::from_mmap(mmap))
    }

    /// Map the whole of an existing file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self::from_mmap(mmap))
    }

    /// Map `len` bytes of an existing file starting at `offset`.
    pub fn open_window(
        path: impl AsRef<Path>,
        offset: u64,
        len: usize,
    ) -> Result<Self, ChannelError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if offset.saturating_add(len as u64) > file_len {
            return Err(ChannelError::OutOfBounds {
                offset: offset as usize,
                len,
                region_len: file_len as usize,
            });
        }

        let mmap = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&file)? };
        Ok(Self::from_mmap(mmap))
    }

    /// Zero-filled private memory, used when both parties live in one process.
    pub fn anonymous(len: usize) -> Result<Self, ChannelError> {
        let mmap = MmapOptions::new().len(len).map_anon()?;
        Ok(Self::from_mmap(mmap))
    }

    fn from_mmap(mut mmap: MmapMut) -> Self {
        let base = mmap.as_mut_ptr();
        let len = mmap.len();
        Self {
            mmap,
            base,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<(), ChannelError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ChannelError::OutOfBounds {
                offset,
                len,
                region_len: self.len,
            }),
        }
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), ChannelError> {
        self.check_range(offset, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<(), ChannelError> {
        self.check_range(offset, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len());
        }
        Ok(())
    }

    pub fn zero(&self, offset: usize, len: usize) -> Result<(), ChannelError> {
        self.check_range(offset, len)?;
        unsafe {
            std::ptr::write_bytes(self.base.add(offset), 0, len);
        }
        Ok(())
    }

    /// Copy a fixed-layout structure out of the region.
    pub fn read<T: FromBytes + IntoBytes>(&self, offset: usize) -> Result<T, ChannelError> {
        let mut value = <T as FromZeros>::new_zeroed();
        self.read_bytes(offset, value.as_mut_bytes())?;
        Ok(value)
    }

    pub fn write<T: IntoBytes + Immutable>(
        &self,
        offset: usize,
        value: &T,
    ) -> Result<(), ChannelError> {
        self.write_bytes(offset, value.as_bytes())
    }

    fn atomic_ptr(&self, offset: usize, size: usize) -> Result<*mut u8, ChannelError> {
        self.check_range(offset, size)?;
        let ptr = unsafe { self.base.add(offset) };
        if (ptr as usize) % size != 0 {
            return Err(ChannelError::Misaligned(offset));
        }
        Ok(ptr)
    }

    pub fn atomic_u8(&self, offset: usize) -> Result<&AtomicU8, ChannelError> {
        let ptr = self.atomic_ptr(offset, 1)?;
        Ok(unsafe { &*(ptr as *const AtomicU8) })
    }

    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32, ChannelError> {
        let ptr = self.atomic_ptr(offset, 4)?;
        Ok(unsafe { &*(ptr as *const AtomicU32) })
    }

    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64, ChannelError> {
        let ptr = self.atomic_ptr(offset, 8)?;
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    pub fn flush(&self) -> Result<(), ChannelError> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// `map_shared_region(physical_address, length)`: turns a published channel
/// location into a usable memory view.
pub trait RegionMapper {
    fn map_shared_region(&self, address: u64, len: usize) -> Result<SharedRegion, ChannelError>;
}

/// `locate_controlvm_channel()`: the privileged query that tells a partition
/// where its control channel lives.
pub trait ChannelLocator {
    fn locate_controlvm_channel(&self) -> Result<(u64, usize), ChannelError>;
}

/// Addresses are byte offsets into a file (typically under `/dev/shm`).
#[derive(Debug, Clone)]
pub struct FileRegionMapper {
    path: PathBuf,
}

impl FileRegionMapper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RegionMapper for FileRegionMapper {
    fn map_shared_region(&self, address: u64, len: usize) -> Result<SharedRegion, ChannelError> {
        SharedRegion::open_window(&self.path, address, len)
    }
}

/// The control channel occupies the whole file, starting at address 0.
#[derive(Debug, Clone)]
pub struct FileChannelLocator {
    path: PathBuf,
}

impl FileChannelLocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ChannelLocator for FileChannelLocator {
    fn locate_controlvm_channel(&self) -> Result<(u64, usize), ChannelError> {
        let len = std::fs::metadata(&self.path)?.len();
        Ok((0, len as usize))
    }
}
