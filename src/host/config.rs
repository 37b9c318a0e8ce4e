//! Static requirements of a test and the host settings it changes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use super::{HostError, Result};

bitflags! {
    /// What to do when a [`SaveRestoreEntry`] path is missing or read-only.
    /// Without a flag, both are `TBROK`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaveRestoreFlags: u32 {
        /// Missing path skips the test (`TCONF`).
        const CONF_MISSING = 1 << 0;
        /// Missing path is ignored.
        const SKIP_MISSING = 1 << 1;
        /// Read-only path skips the test.
        const CONF_RO = 1 << 2;
        /// Read-only path is ignored.
        const SKIP_RO = 1 << 3;
        /// Any other write error is ignored.
        const IGNORE_ERR = 1 << 4;
    }
}

/// A host setting, usually under `/proc/sys` or `/sys`, to save before the
/// test and restore afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveRestoreEntry {
    pub path: &'static str,
    /// Written after saving, if set.
    pub value: Option<&'static str>,
    pub flags: SaveRestoreFlags,
}

impl SaveRestoreEntry {
    pub const fn new(path: &'static str, value: Option<&'static str>, flags: SaveRestoreFlags) -> Self {
        Self { path, value, flags }
    }
}

/// Test metadata checked before the VM is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Values of [`std::env::consts::ARCH`] the test runs on. Empty means any.
    pub supported_archs: &'static [&'static str],
    /// Kernel modules that must be loaded, or built in.
    pub needs_drivers: &'static [&'static str],
    pub min_cpus: usize,
    pub save_restore: &'static [SaveRestoreEntry],
    /// Where loaded modules show up.
    pub module_root: &'static str,
}

impl HarnessConfig {
    /// Defaults for a KVM test: x86_64 only, `kvm` loaded.
    pub const KVM: Self = Self {
        supported_archs: &["x86_64"],
        needs_drivers: &["kvm"],
        min_cpus: 1,
        save_restore: &[],
        module_root: "/sys/module",
    };

    /// Fails with [`HostError::Unsupported`] if the host cannot run the test.
    pub fn check(&self) -> Result {
        let arch = std::env::consts::ARCH;
        if !self.supported_archs.is_empty() && !self.supported_archs.contains(&arch) {
            return Err(HostError::Unsupported(format!("Test not supported on {arch}")));
        }

        let root = Path::new(self.module_root);
        if let Some(missing) = self.needs_drivers.iter().find(|name| !root.join(name).exists()) {
            return Err(HostError::Unsupported(format!("{missing} driver not available")));
        }

        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        if cpus < self.min_cpus {
            return Err(HostError::Unsupported(format!(
                "Test needs at least {} CPUs online, {} available",
                self.min_cpus, cpus
            )));
        }
        Ok(())
    }

    /// Saves every [`SaveRestoreEntry`] and writes the new values. The
    /// returned guard puts the saved values back when dropped.
    pub fn apply(&self) -> Result<RestoreGuard> {
        let mut guard = RestoreGuard { saved: Vec::new() };
        for entry in self.save_restore {
            let path = Path::new(entry.path);
            let old = match fs::read_to_string(path) {
                Ok(old) => old,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if entry.flags.contains(SaveRestoreFlags::SKIP_MISSING) {
                        debug!("{} is missing, skipping", entry.path);
                        continue;
                    }
                    if entry.flags.contains(SaveRestoreFlags::CONF_MISSING) {
                        return Err(HostError::Unsupported(format!("{} is missing", entry.path)));
                    }
                    return Err(file_error(path, err));
                }
                Err(err) => return Err(file_error(path, err)),
            };
            let old = old.trim_end_matches('\n').to_string();

            if let Some(value) = entry.value {
                if let Err(err) = fs::write(path, value) {
                    if is_read_only(&err) && entry.flags.contains(SaveRestoreFlags::SKIP_RO) {
                        debug!("{} is read-only, skipping", entry.path);
                        continue;
                    }
                    if is_read_only(&err) && entry.flags.contains(SaveRestoreFlags::CONF_RO) {
                        return Err(HostError::Unsupported(format!("{} is read-only", entry.path)));
                    }
                    if !entry.flags.contains(SaveRestoreFlags::IGNORE_ERR) {
                        return Err(file_error(path, err));
                    }
                    warn!("Failed to write {} to {}: {}", value, entry.path, err);
                    continue;
                }
            }
            guard.saved.push((path.to_path_buf(), old));
        }
        Ok(guard)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::KVM
    }
}

fn is_read_only(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
    )
}

fn file_error(path: &Path, source: io::Error) -> HostError {
    HostError::File {
        path: path.to_path_buf(),
        source,
    }
}

/// Restores saved host settings on drop, in reverse order.
#[derive(Debug)]
#[must_use = "dropping the guard restores the settings immediately"]
pub struct RestoreGuard {
    saved: Vec<(PathBuf, String)>,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        for (path, value) in self.saved.drain(..).rev() {
            if let Err(err) = fs::write(&path, &value) {
                warn!("Failed to restore {}: {}", path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn scratch_dir() -> PathBuf {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "x86_kvm_harness-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn leak_str(s: String) -> &'static str {
        Box::leak(s.into_boxed_str())
    }

    #[test]
    fn test_missing_driver_is_conf() {
        let root = scratch_dir();
        fs::create_dir(root.join("kvm")).unwrap();
        let config = HarnessConfig {
            supported_archs: &[],
            needs_drivers: &["kvm", "kvm_amd_missing"],
            module_root: leak_str(root.display().to_string()),
            ..HarnessConfig::KVM
        };
        let err = config.check().unwrap_err();
        assert_eq!(err.to_string(), "kvm_amd_missing driver not available");
        assert_eq!(err.outcome(), crate::TestResult::Conf);

        let config = HarnessConfig {
            needs_drivers: &["kvm"],
            ..config
        };
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_arch_and_cpus() {
        let config = HarnessConfig {
            supported_archs: &["not-an-arch"],
            needs_drivers: &[],
            ..HarnessConfig::KVM
        };
        assert!(matches!(config.check(), Err(HostError::Unsupported(_))));

        let config = HarnessConfig {
            supported_archs: &[],
            needs_drivers: &[],
            min_cpus: usize::MAX,
            ..HarnessConfig::KVM
        };
        assert!(matches!(config.check(), Err(HostError::Unsupported(_))));
    }

    #[test]
    fn test_save_and_restore() {
        let dir = scratch_dir();
        let knob = dir.join("knob");
        fs::write(&knob, "0\n").unwrap();
        let entries = Box::leak(Box::new([
            SaveRestoreEntry::new(leak_str(knob.display().to_string()), Some("1"), SaveRestoreFlags::empty()),
            SaveRestoreEntry::new(
                leak_str(dir.join("absent").display().to_string()),
                Some("1"),
                SaveRestoreFlags::SKIP_MISSING,
            ),
        ]));
        let config = HarnessConfig {
            save_restore: entries,
            ..HarnessConfig::KVM
        };

        let guard = config.apply().unwrap();
        assert_eq!(fs::read_to_string(&knob).unwrap(), "1");
        drop(guard);
        assert_eq!(fs::read_to_string(&knob).unwrap(), "0");
    }

    #[test]
    fn test_missing_entry() {
        let dir = scratch_dir();
        let path = leak_str(dir.join("absent").display().to_string());
        let conf = Box::leak(Box::new([SaveRestoreEntry::new(path, None, SaveRestoreFlags::CONF_MISSING)]));
        let config = HarnessConfig {
            save_restore: conf,
            ..HarnessConfig::KVM
        };
        assert!(matches!(config.apply(), Err(HostError::Unsupported(_))));

        let brok = Box::leak(Box::new([SaveRestoreEntry::new(path, None, SaveRestoreFlags::empty())]));
        let config = HarnessConfig {
            save_restore: brok,
            ..HarnessConfig::KVM
        };
        let err = config.apply().unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert_eq!(err.outcome(), crate::TestResult::Broken);
    }
}
