use crate::ImageAttachOps;
use std::path::{Path, PathBuf};

/// RAII guard that detaches an attached disk image when dropped.
#[derive(Debug)]
pub struct ImageMountGuard<'a, H: ImageAttachOps + ?Sized> {
    hal: &'a H,
    mount_point: PathBuf,
    active: bool,
}

impl<'a, H: ImageAttachOps + ?Sized> ImageMountGuard<'a, H> {
    pub fn new(hal: &'a H, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            hal,
            mount_point: mount_point.into(),
            active: true,
        }
    }

    /// Prevent automatic detach and return the mount point.
    pub fn release(mut self) -> PathBuf {
        self.active = false;
        self.mount_point.clone()
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }
}

impl<'a, H: ImageAttachOps + ?Sized> Drop for ImageMountGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.hal.detach_image(&self.mount_point) {
            log::warn!(
                "image guard failed to detach {}: {}",
                self.mount_point.display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FakeHal, Operation};

    #[test]
    fn guard_detaches_on_drop() {
        let hal = FakeHal::new();
        {
            let _guard = ImageMountGuard::new(&hal, "/Volumes/CCCOMA_X64FRE");
        }
        assert!(hal.has_operation(|op| matches!(op, Operation::DetachImage { .. })));
    }

    #[test]
    fn release_skips_detach() {
        let hal = FakeHal::new();
        {
            let guard = ImageMountGuard::new(&hal, "/Volumes/CCCOMA_X64FRE");
            let _ = guard.release();
        }
        assert!(!hal.has_operation(|op| matches!(op, Operation::DetachImage { .. })));
    }
}
