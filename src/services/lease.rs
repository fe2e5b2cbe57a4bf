use log::{info, warn};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::utils::error::{WatcherError, WatcherResult};

/// Exclusive claim on the Module-M USB link, held as a lock file.
///
/// The firmware updater takes the lease; the watcher polls `is_held` and
/// keeps its hands off the port while it exists.
pub struct LinkLease;

/// Releases the lease when dropped.
#[derive(Debug)]
pub struct LeaseGuard {
    path: PathBuf,
}

impl LeaseGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("🔓 Released link lease {}", self.path.display()),
            Err(e) => warn!("⚠️  Could not remove link lease {}: {}", self.path.display(), e),
        }
    }
}

impl LinkLease {
    pub fn acquire<P: AsRef<Path>>(path: P) -> WatcherResult<LeaseGuard> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    info!("🔒 Took link lease {}", path.display());
                    return Ok(LeaseGuard {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(pid) = holder(path).filter(|pid| !process_alive(*pid)) {
                        warn!("⚠️  Removing stale link lease left by pid {}", pid);
                        fs::remove_file(path)?;
                        continue;
                    }
                    return Err(WatcherError::LinkUnavailable(format!(
                        "link lease {} is held by pid {}",
                        path.display(),
                        holder(path).map_or_else(|| "unknown".to_string(), |p| p.to_string())
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(WatcherError::LinkUnavailable(format!(
            "could not take link lease {}",
            path.display()
        )))
    }

    /// True while a live process holds the lease.
    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        if !path.exists() {
            return false;
        }
        match holder(path) {
            Some(pid) => process_alive(pid),
            // Being written right now
            None => true,
        }
    }
}

fn holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.exists() {
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks/fw.lock");

        let guard = LinkLease::acquire(&path).unwrap();
        assert!(LinkLease::is_held(&path));
        assert!(matches!(LinkLease::acquire(&path), Err(WatcherError::LinkUnavailable(_))));

        drop(guard);
        assert!(!LinkLease::is_held(&path));
        assert!(!path.exists());
    }

    #[test]
    fn stale_lease_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.lock");
        // Pid far above pid_max
        fs::write(&path, "4294967\n").unwrap();
        if !Path::new("/proc").exists() {
            return;
        }

        assert!(!LinkLease::is_held(&path));
        let _guard = LinkLease::acquire(&path).unwrap();
        assert!(LinkLease::is_held(&path));
    }
}
