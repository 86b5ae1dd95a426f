//! Read-only shared-memory segments
//!
//! Each overlay window's pixels live in a named segment written by the
//! producer process. This side only opens existing segments read-only and maps
//! them for the lifetime of the binding.

use std::io;
use thiserror::Error;

use overlay_proto::FrameBufferHeader;

/// Failure to open a frame segment
#[derive(Debug, Error)]
pub enum BindError {
    /// No segment with that name exists (yet)
    #[error("shared memory segment {name:?} not found")]
    NotFound { name: String },

    /// The name can never refer to a segment
    #[error("invalid shared memory segment name {name:?}")]
    InvalidName { name: String },

    /// The segment cannot even hold a frame header
    #[error("shared memory segment {name:?} is too small ({len} bytes)")]
    TooSmall { name: String, len: usize },

    #[error("failed to map shared memory segment {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    /// Whether the segment may become available on a later sync
    pub fn is_retryable(&self) -> bool {
        matches!(self, BindError::NotFound { .. } | BindError::Io { .. })
    }
}

/// An open, read-only frame segment
pub trait FrameSegment {
    /// Run `f` over the mapped bytes of the segment
    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R;
}

/// Opens frame segments by name
pub trait SegmentOpener {
    type Segment: FrameSegment;

    fn open_read_only(&self, name: &str) -> Result<Self::Segment, BindError>;
}

/// Opener for the operating system's named shared memory
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedMemoryOpener;

fn check_len(name: &str, len: usize) -> Result<(), BindError> {
    if len < FrameBufferHeader::size() {
        return Err(BindError::TooSmall {
            name: name.to_string(),
            len,
        });
    }
    Ok(())
}

#[cfg(unix)]
mod platform {
    use super::*;
    use std::ffi::CString;
    use std::ptr::NonNull;
    use tracing::trace;

    /// A POSIX shared memory object mapped with `PROT_READ`
    #[derive(Debug)]
    pub struct ShmSegment {
        ptr: NonNull<u8>,
        len: usize,
    }

    // The mapping is read-only and owned exclusively by this value.
    unsafe impl Send for ShmSegment {}

    /// POSIX object names must start with a single slash
    pub(super) fn posix_name(name: &str) -> String {
        format!("/{}", name.trim_start_matches('/'))
    }

    impl FrameSegment for ShmSegment {
        fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
            let bytes = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
            f(bytes)
        }
    }

    impl Drop for ShmSegment {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }

    impl SegmentOpener for SharedMemoryOpener {
        type Segment = ShmSegment;

        fn open_read_only(&self, name: &str) -> Result<ShmSegment, BindError> {
            let posix = posix_name(name);
            if posix.len() < 2 || posix[1..].contains('/') {
                return Err(BindError::InvalidName {
                    name: name.to_string(),
                });
            }
            let c_name = CString::new(posix).map_err(|_| BindError::InvalidName {
                name: name.to_string(),
            })?;

            let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
            if fd < 0 {
                let err = io::Error::last_os_error();
                return Err(match err.kind() {
                    io::ErrorKind::NotFound => BindError::NotFound {
                        name: name.to_string(),
                    },
                    _ => BindError::Io {
                        name: name.to_string(),
                        source: err,
                    },
                });
            }

            let result = map_fd(name, fd);
            unsafe { libc::close(fd) };
            result
        }
    }

    fn map_fd(name: &str, fd: libc::c_int) -> Result<ShmSegment, BindError> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            return Err(BindError::Io {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let len = usize::try_from(stat.st_size).unwrap_or(0);
        check_len(name, len)?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BindError::Io {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        trace!("Mapped shared memory {:?} ({} bytes)", name, len);
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| BindError::Io {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::Other, "mmap returned null"),
        })?;
        Ok(ShmSegment { ptr, len })
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use tracing::trace;
    use windows::core::HSTRING;
    use windows::Win32::Foundation::{CloseHandle, ERROR_FILE_NOT_FOUND, HANDLE};
    use windows::Win32::System::Memory::{
        MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery, FILE_MAP_READ,
        MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS,
    };

    /// A named file mapping viewed with `FILE_MAP_READ`
    #[derive(Debug)]
    pub struct ShmSegment {
        handle: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        len: usize,
    }

    unsafe impl Send for ShmSegment {}

    impl FrameSegment for ShmSegment {
        fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
            let bytes =
                unsafe { std::slice::from_raw_parts(self.view.Value as *const u8, self.len) };
            f(bytes)
        }
    }

    impl Drop for ShmSegment {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(self.view);
                let _ = CloseHandle(self.handle);
            }
        }
    }

    impl SegmentOpener for SharedMemoryOpener {
        type Segment = ShmSegment;

        fn open_read_only(&self, name: &str) -> Result<ShmSegment, BindError> {
            if name.is_empty() || name.contains('\0') {
                return Err(BindError::InvalidName {
                    name: name.to_string(),
                });
            }

            let handle = unsafe { OpenFileMappingW(FILE_MAP_READ.0, false, &HSTRING::from(name)) }
                .map_err(|e| {
                    if e.code() == ERROR_FILE_NOT_FOUND.to_hresult() {
                        BindError::NotFound {
                            name: name.to_string(),
                        }
                    } else {
                        BindError::Io {
                            name: name.to_string(),
                            source: io::Error::other(e),
                        }
                    }
                })?;

            let view = unsafe { MapViewOfFile(handle, FILE_MAP_READ, 0, 0, 0) };
            if view.Value.is_null() {
                let source = io::Error::last_os_error();
                unsafe {
                    let _ = CloseHandle(handle);
                }
                return Err(BindError::Io {
                    name: name.to_string(),
                    source,
                });
            }

            let mut info = MEMORY_BASIC_INFORMATION::default();
            let queried = unsafe {
                VirtualQuery(
                    Some(view.Value),
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            let segment = ShmSegment {
                handle,
                view,
                len: if queried == 0 { 0 } else { info.RegionSize },
            };
            check_len(name, segment.len)?;

            trace!("Mapped shared memory {:?} ({} bytes)", name, segment.len);
            Ok(segment)
        }
    }
}

pub use platform::ShmSegment;
