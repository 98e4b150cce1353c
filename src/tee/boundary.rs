//! Memory boundary for secret material.
//!
//! Unsealed key bytes only ever travel through the crate inside
//! [`Protected`]. The wrapper has no `Serialize`, `Clone` or `Deref` impl,
//! prints a placeholder for `Debug`/`Display`, and zeroizes its contents on
//! drop. Heap buffers are additionally `mlock`ed on Linux so they are never
//! written to swap.

use std::borrow::Cow;
use std::fmt;

use zeroize::Zeroize;

/// Secret value confined to the TEE boundary.
pub struct Protected<T: Zeroize> {
    value: T,
    label: Cow<'static, str>,
    /// Address range passed to `mlock`, released on drop.
    locked: Option<(usize, usize)>,
}

impl<T: Zeroize> Protected<T> {
    /// Wrap a secret value under a descriptive label.
    ///
    /// The label shows up in `Debug` output in place of the value, so it
    /// must not itself be secret.
    pub fn new(value: T, label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            value,
            label: label.into(),
            locked: None,
        }
    }

    /// Borrow the secret. Callers must not copy it out of the borrow.
    pub fn expose(&self) -> &T {
        &self.value
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Protected<Vec<u8>> {
    /// Wrap a heap buffer and lock its pages in RAM (Linux only).
    ///
    /// Locking is best-effort: on failure the buffer is still zeroized on
    /// drop, it just may be swapped out in the meantime.
    pub fn locked(bytes: Vec<u8>, label: impl Into<Cow<'static, str>>) -> Self {
        let mut protected = Self::new(bytes, label);
        if !protected.value.is_empty() {
            match mlock_bytes(&protected.value) {
                Ok(()) => {
                    protected.locked =
                        Some((protected.value.as_ptr() as usize, protected.value.len()));
                }
                Err(e) => {
                    tracing::debug!(label = %protected.label, error = %e, "mlock failed for protected buffer");
                }
            }
        }
        protected
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Whether the buffer's pages were successfully locked.
    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }
}

impl<T: Zeroize> fmt::Debug for Protected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[TEE Protected: {}]", self.label)
    }
}

impl<T: Zeroize> fmt::Display for Protected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[TEE Protected: {}]", self.label)
    }
}

impl<T: Zeroize> Drop for Protected<T> {
    fn drop(&mut self) {
        self.value.zeroize();
        if let Some((addr, len)) = self.locked.take() {
            munlock_range(addr, len);
        }
    }
}

/// Zero a transient buffer in place.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}

/// Lock memory pages to prevent swapping to disk.
///
/// On Linux, calls `mlock(2)`. On other platforms, this is a no-op.
fn mlock_bytes(data: &[u8]) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        // Safety: we pass a valid pointer and length from a live Vec<u8>.
        let ret = unsafe { libc::mlock(data.as_ptr() as *const libc::c_void, data.len()) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = data;
    }
    Ok(())
}

/// Unlock memory pages previously locked with `mlock_bytes`.
fn munlock_range(addr: usize, len: usize) {
    #[cfg(target_os = "linux")]
    {
        // Safety: the range was locked from a Vec that is still allocated;
        // the owning Protected has not released it yet.
        unsafe {
            libc::munlock(addr as *const libc::c_void, len);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (addr, len);
    }
}
