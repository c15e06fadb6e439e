use std::ptr::NonNull;

const REGION_ALIGN: usize = 64;

/// An owned backing region for an ether: either a file-backed shared
/// mapping or a private zeroed heap allocation.
///
/// The region is released when dropped; all pointers handed out become
/// invalid at that point. `Ether` keeps its region alive for as long as any
/// cursor can reach the slots.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    kind: RegionKind,
}

#[derive(Debug)]
enum RegionKind {
    Mapped,
    Heap,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Maps `size` bytes of the given file as shared writable memory.
    ///
    /// The file is created if missing and truncated (grown) to `size`. With
    /// `reset` the mapped bytes are zeroed, which also forces the pages to
    /// be backed. The descriptor is closed immediately; the mapping stays
    /// valid.
    ///
    /// Multiple processes mapping the same path observe the same bytes;
    /// this is the transport for shared ethers.
    pub fn map_file(path: &str, size: usize, reset: bool) -> std::io::Result<Self> {
        let addr = unsafe {
            let cpath = std::ffi::CString::new(path)
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

            let fd = libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
                0o644,
            );
            if fd == -1 {
                return Err(std::io::Error::last_os_error());
            }

            if libc::ftruncate(fd, size as libc::off_t) == -1 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let addr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );

            if addr == libc::MAP_FAILED {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            } else {
                libc::close(fd); // mapping stays valid
            }

            if reset {
                std::ptr::write_bytes(addr as *mut u8, 0, size);
            }

            addr
        };

        Ok(Self {
            ptr: NonNull::new(addr as *mut u8).unwrap(),
            len: size,
            kind: RegionKind::Mapped,
        })
    }

    /// Allocates a private zeroed region, cache-line aligned.
    pub fn anonymous(size: usize) -> std::io::Result<Self> {
        let layout = std::alloc::Layout::from_size_align(size, REGION_ALIGN)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self {
                ptr,
                len: size,
                kind: RegionKind::Heap,
            }),
            None => Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory)),
        }
    }

    #[inline(always)]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Region {
    /// Releases the backing memory.
    ///
    /// # Panics
    ///
    /// Panics if unmapping a shared region fails. This is considered an
    /// unrecoverable error, as leaking or corrupting a shared mapping can
    /// break other processes attached to the same file.
    fn drop(&mut self) {
        match self.kind {
            RegionKind::Mapped => unsafe {
                if libc::munmap(self.ptr.as_ptr().cast(), self.len) == -1 {
                    panic!("Region::drop failed: {}", std::io::Error::last_os_error());
                }
            },
            RegionKind::Heap => unsafe {
                let layout = std::alloc::Layout::from_size_align_unchecked(self.len, REGION_ALIGN);
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            },
        }
    }
}
