/*!
Permission descriptor capability.

A permission descriptor is an opaque, platform-specific blob (for example the
POSIX ACL text produced by `getfacl`) that the archiver stores alongside an
entry and hands back on extraction. [`platform_permissions`] is the only place
that decides which implementation the current platform gets.
*/

use crate::{Result, StashError};
use std::path::Path;
use std::sync::Arc;

/// Reads and applies permission descriptors for filesystem entries.
pub trait PermissionProvider: Send + Sync {
    /// Short name used in log output
    fn name(&self) -> &'static str;

    /// Capture the descriptor for `path`, or `None` when the entry carries
    /// nothing beyond its mode bits.
    fn descriptor(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Apply a descriptor previously returned by [`descriptor`](Self::descriptor).
    fn apply(&self, path: &Path, descriptor: &[u8]) -> Result<()>;
}

/// Provider for platforms without descriptor support
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPermissions;

impl PermissionProvider for NoPermissions {
    fn name(&self) -> &'static str {
        "none"
    }

    fn descriptor(&self, _path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn apply(&self, _path: &Path, _descriptor: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Select the descriptor provider for the running platform.
pub fn platform_permissions() -> Arc<dyn PermissionProvider> {
    #[cfg(unix)]
    {
        if let Some(provider) = posix::PosixAclPermissions::detect() {
            return Arc::new(provider);
        }
        tracing::debug!("getfacl/setfacl not found on PATH, permission descriptors disabled");
    }
    Arc::new(NoPermissions)
}

#[cfg(unix)]
pub use posix::PosixAclPermissions;

#[cfg(unix)]
mod posix {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::process::Command;
    use tracing::debug;

    /// POSIX ACLs via the `getfacl`/`setfacl` tools
    #[derive(Debug, Clone)]
    pub struct PosixAclPermissions {
        getfacl: PathBuf,
        setfacl: PathBuf,
    }

    impl PosixAclPermissions {
        /// Locate both tools on `PATH`
        pub fn detect() -> Option<Self> {
            Some(Self {
                getfacl: find_on_path("getfacl")?,
                setfacl: find_on_path("setfacl")?,
            })
        }
    }

    impl PermissionProvider for PosixAclPermissions {
        fn name(&self) -> &'static str {
            "posix-acl"
        }

        fn descriptor(&self, path: &Path) -> Result<Option<Vec<u8>>> {
            // --skip-base prints nothing for entries whose ACL is just the mode bits
            let output = Command::new(&self.getfacl)
                .arg("--absolute-names")
                .arg("--skip-base")
                .arg(path)
                .output()?;

            if !output.status.success() {
                return Err(StashError::archive(format!(
                    "getfacl failed for {}: {}",
                    path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }

            if output.stdout.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            Ok(Some(output.stdout))
        }

        fn apply(&self, path: &Path, descriptor: &[u8]) -> Result<()> {
            let mut rules = tempfile::NamedTempFile::new()?;
            rules.write_all(descriptor)?;
            rules.flush()?;

            let mut set_file = std::ffi::OsString::from("--set-file=");
            set_file.push(rules.path());

            let output = Command::new(&self.setfacl).arg(set_file).arg(path).output()?;
            if !output.status.success() {
                return Err(StashError::archive(format!(
                    "setfacl failed for {}: {}",
                    path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            debug!(path = %path.display(), "Applied ACL");
            Ok(())
        }
    }

    fn find_on_path(program: &str) -> Option<PathBuf> {
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_permissions_is_inert() {
        let provider = NoPermissions;
        assert_eq!(provider.name(), "none");
        assert!(provider.descriptor(Path::new("/nonexistent")).unwrap().is_none());
        assert!(provider.apply(Path::new("/nonexistent"), b"user::rw-").is_ok());
    }

    #[test]
    fn test_platform_permissions_returns_a_provider() {
        let provider = platform_permissions();
        assert!(["none", "posix-acl"].contains(&provider.name()));
    }
}
