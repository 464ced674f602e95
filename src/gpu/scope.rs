use std::ops::{Deref, DerefMut};

use super::GpuBackend;

/// Scoped bracket around a block of GPU calls.
///
/// Everything recorded through the scope is submitted when it drops, including
/// on early `?` returns, so a failed tick never leaves half-recorded work
/// behind for the next one.
///
/// ```ignore
/// let mut gpu = CommandScope::new(&mut backend);
/// gpu.clear(texture, 0, [0.0; 4])?;
/// gpu.blit(a, 0, b, 0)?;
/// // flushed here
/// ```
pub struct CommandScope<'a> {
    backend: &'a mut dyn GpuBackend,
}

impl<'a> CommandScope<'a> {
    pub fn new(backend: &'a mut dyn GpuBackend) -> Self {
        Self { backend }
    }
}

impl<'a> Deref for CommandScope<'a> {
    type Target = dyn GpuBackend + 'a;

    fn deref(&self) -> &Self::Target {
        self.backend
    }
}

impl<'a> DerefMut for CommandScope<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend
    }
}

impl Drop for CommandScope<'_> {
    fn drop(&mut self) {
        self.backend.flush();
    }
}
