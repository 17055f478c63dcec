//! Broker socket path derivation and lifecycle.
//!
//! Each broker instance owns one Unix domain socket at a fixed, per-user,
//! per-endpoint path. The socket file is created with owner-only
//! permissions and removed on shutdown.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Maximum path length for a Unix domain socket (macOS kernel limit; the
/// Linux limit is slightly higher, so the stricter bound applies).
const MAX_SOCK_PATH: usize = 104;

/// Build the broker socket path for a logical endpoint name.
///
/// Format: `{runtime_dir}/sshmux-{uid}/{endpoint}.sock`, where the runtime
/// dir is `$XDG_RUNTIME_DIR` if set, `/tmp` otherwise. Length is validated
/// against the kernel limit before use.
pub fn socket_path(endpoint: &str) -> Result<PathBuf> {
    if endpoint.is_empty() || endpoint.contains('/') {
        bail!("invalid endpoint name: {endpoint:?}");
    }
    let uid = unsafe { libc::getuid() };
    let runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".into());
    let path = PathBuf::from(runtime).join(format!("sshmux-{uid}")).join(format!("{endpoint}.sock"));
    let path_str = path.to_string_lossy();
    if path_str.len() > MAX_SOCK_PATH {
        bail!("socket path too long ({} > {MAX_SOCK_PATH}): {path_str}", path_str.len());
    }
    Ok(path)
}

/// Prepare the socket's parent directory (owner-only) and remove any stale
/// socket file left by a previous run.
pub fn prepare(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket dir: {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
        }
    }
    let _ = std::fs::remove_file(path);
    Ok(())
}

/// Restrict a freshly bound socket file to its owner.
pub fn restrict(path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
}
