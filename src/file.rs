//! File cleanups: closing descriptors and removing temporary files.

use std::ffi::OsStr;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

use crate::cleanup::CleanupHandler;
use crate::error::{Error, Result};
use crate::pool::Pool;

/// Data shared by the file cleanup handlers.
///
/// Lives in pool memory next to a pool-owned copy of the file name. The pool
/// takes over the descriptor: it is closed exactly once by the handler.
#[derive(Debug, Clone, Copy)]
pub struct FileCleanup {
    fd: RawFd,
    name: NonNull<[u8]>,
}

impl FileCleanup {
    /// The descriptor to close.
    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    /// The file's name.
    #[must_use]
    pub fn name(&self) -> &Path {
        // SAFETY: the name is copied into the same pool as this struct
        Path::new(OsStr::from_bytes(unsafe { self.name.as_ref() }))
    }
}

/// Closes the descriptor, reporting failure to the current span.
pub(crate) fn close_file(file: &FileCleanup) {
    tracing::debug!(fd = file.fd, "file cleanup");
    close(file);
}

/// Removes the file, then closes the descriptor.
///
/// A file that is already gone is not an error.
pub(crate) fn delete_file(file: &FileCleanup) {
    tracing::debug!(fd = file.fd, name = %file.name().display(), "file cleanup");

    if let Err(err) = std::fs::remove_file(file.name()) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::error!(
                name = %file.name().display(),
                error = %err,
                "delete file failed"
            );
        }
    }

    close(file);
}

fn close(file: &FileCleanup) {
    // SAFETY: the pool owns the descriptor and closes it only here
    if unsafe { libc::close(file.fd) } == -1 {
        tracing::error!(
            fd = file.fd,
            name = %file.name().display(),
            error = %io::Error::last_os_error(),
            "close file failed"
        );
    }
}

impl Pool {
    /// Hands `fd` to the pool: it is closed when the pool is destroyed.
    ///
    /// # Arguments
    ///
    /// * `fd` - The descriptor to close. The pool owns it from now on.
    /// * `name` - The file's name, copied into pool memory for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns the underlying allocator's error; the descriptor then stays
    /// with the caller.
    pub fn cleanup_add_file(&mut self, fd: RawFd, name: &Path) -> Result<()> {
        self.register_file(fd, name, CleanupHandler::CloseFile)
    }

    /// Hands a temporary file to the pool: it is deleted and its descriptor
    /// closed when the pool is destroyed.
    ///
    /// # Errors
    ///
    /// See [`cleanup_add_file`](Self::cleanup_add_file).
    pub fn cleanup_add_temp_file(&mut self, fd: RawFd, name: &Path) -> Result<()> {
        self.register_file(fd, name, CleanupHandler::DeleteFile)
    }

    /// Closes `fd` now if it was registered with
    /// [`cleanup_add_file`](Self::cleanup_add_file), so destruction skips it.
    ///
    /// Does nothing for unknown descriptors and for temporary files.
    ///
    /// # Arguments
    ///
    /// * `fd` - A descriptor passed to `cleanup_add_file`. Only the most
    ///   recently registered pending node for it is run.
    pub fn run_file_cleanup(&mut self, fd: RawFd) {
        let _entered = self.log.enter();

        for node in self.cleanup.iter() {
            // SAFETY: linked nodes live in pool blocks
            let entry = unsafe { &mut (*node.as_ptr()).data };

            if !matches!(entry.handler, Some(CleanupHandler::CloseFile)) {
                continue;
            }
            let Some(data) = entry.data else {
                continue;
            };

            // SAFETY: CloseFile is only attached to FileCleanup data
            let file = unsafe { data.cast::<FileCleanup>().as_ref() };
            if file.fd == fd {
                close_file(file);
                entry.handler = None;
                return;
            }
        }
    }

    fn register_file(&mut self, fd: RawFd, name: &Path, handler: CleanupHandler) -> Result<()> {
        let name = self.copy_bytes(name.as_os_str().as_bytes())?;

        let mut cleanup = self.cleanup_add(size_of::<FileCleanup>())?;
        let data = cleanup
            .data()
            .ok_or(Error::InvalidSize(size_of::<FileCleanup>()))?;

        // SAFETY: data is aligned and sized for a FileCleanup, and the file
        // handlers are attached only after it is written
        unsafe {
            data.cast::<FileCleanup>().write(FileCleanup { fd, name });
            cleanup.set_handler(handler);
        }

        Ok(())
    }
}
