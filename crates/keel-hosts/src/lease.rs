//! Write leases over `fcntl(F_SETLEASE)`.
//!
//! A write lease makes concurrent `open(2)` calls from other processes
//! block until the lease holder finishes rewriting, which keeps container
//! readers from observing a half-written hosts file. Lease acquisition is
//! best-effort: it fails when another process holds the file open, so the
//! caller chooses between retry-then-give-up and retry-then-proceed.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use keel_common::{KeelError, KeelResult};

/// An open file handle, optionally holding a kernel write lease.
#[derive(Debug)]
pub struct FileLease {
    file: File,
    leased: bool,
}

impl FileLease {
    /// Open `path` for writing and try to take a write lease on it.
    ///
    /// Acquisition is retried `attempts` times at `interval`. When the
    /// lease cannot be taken and `must_lease` is false, the plain handle is
    /// returned anyway.
    ///
    /// # Errors
    ///
    /// [`KeelError::ResourceBusy`] when `must_lease` is set and the lease
    /// stayed unavailable; [`KeelError::NotImplemented`] on non-Linux
    /// platforms with `must_lease` set.
    #[cfg(target_os = "linux")]
    pub fn acquire(
        path: &Path,
        attempts: u32,
        interval: Duration,
        must_lease: bool,
    ) -> KeelResult<Self> {
        use std::os::fd::AsRawFd;

        let file = OpenOptions::new().write(true).create(true).open(path)?;

        for attempt in 0..attempts {
            // SAFETY: plain fcntl on an owned, open fd.
            #[allow(unsafe_code)]
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLEASE, libc::F_WRLCK) };
            if rc == 0 {
                return Ok(Self { file, leased: true });
            }
            if attempt + 1 < attempts {
                std::thread::sleep(interval);
            }
        }

        if must_lease {
            return Err(KeelError::ResourceBusy {
                resource: format!("write lease on {}", path.display()),
            });
        }

        tracing::debug!(path = %path.display(), "Proceeding without write lease");
        Ok(Self {
            file,
            leased: false,
        })
    }

    /// Non-Linux fallback: leases are unavailable.
    #[cfg(not(target_os = "linux"))]
    pub fn acquire(
        path: &Path,
        _attempts: u32,
        _interval: Duration,
        must_lease: bool,
    ) -> KeelResult<Self> {
        if must_lease {
            return Err(KeelError::NotImplemented {
                feature: "file leases",
            });
        }
        let file = OpenOptions::new().write(true).create(true).open(path)?;
        Ok(Self {
            file,
            leased: false,
        })
    }

    /// Whether the kernel granted the lease.
    #[must_use]
    pub fn leased(&self) -> bool {
        self.leased
    }

    /// Truncate and rewrite the open fd with `content`.
    ///
    /// While the lease is held, readers opening the file block until
    /// [`FileLease`] is dropped.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error unchanged.
    pub fn write_file(&mut self, content: &[u8]) -> KeelResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(content)?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if self.leased {
            use std::os::fd::AsRawFd;
            // SAFETY: releasing a lease we hold on an owned fd.
            #[allow(unsafe_code)]
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLEASE, libc::F_UNLCK) };
            if rc != 0 {
                tracing::warn!("Failed to release file lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "old content that is longer").unwrap();

        let mut lease =
            FileLease::acquire(&path, 1, Duration::from_millis(1), false).unwrap();
        lease.write_file(b"new").unwrap();
        drop(lease);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn acquire_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh");
        let lease = FileLease::acquire(&path, 1, Duration::from_millis(1), false).unwrap();
        drop(lease);
        assert!(path.exists());
    }
}
