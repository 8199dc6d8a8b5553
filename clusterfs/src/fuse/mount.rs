//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Linux, through fusermount3 (unprivileged mount).
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions as FuseMountOptions;
use rfuse3::raw::MountHandle;

use super::FuseAdapter;

/// Build default mount options for clusterfs.
fn default_mount_options() -> FuseMountOptions {
    let mut mo = FuseMountOptions::default();
    mo.fs_name("clusterfs");
    // no allow_other, require an empty mount point
    mo
}

/// Mount the adapter on an empty directory. The filesystem is served in the
/// background until the returned handle is unmounted or dropped.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: FuseAdapter,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<MountHandle> {
    let session = rfuse3::raw::Session::new(default_mount_options());
    session.mount_with_unprivileged(fs, mount_point).await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: FuseAdapter,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
