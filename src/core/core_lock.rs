//! Advisory per-core lock files. Each owned lcore is claimed with an
//! exclusive flock on `/var/tmp/reactor_engine_cpu_lock_NNN` before the
//! reactors start, preventing two engine processes from binding the same
//! core. The pid of the owner is written into the file so a losing process
//! can report who holds the core.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    os::unix::io::AsRawFd,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::{cpu_cores::Cores, CoreError};

static CORE_LOCKS: Lazy<Mutex<HashMap<u32, File>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_path(core: u32) -> String {
    format!("/var/tmp/reactor_engine_cpu_lock_{:03}", core)
}

fn claim_core(core: u32) -> Result<File, CoreError> {
    let path = lock_path(core);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(|e| CoreError::CoreLockFile {
            path: path.clone(),
            source: e,
        })?;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
        let mut owner = String::new();
        file.read_to_string(&mut owner).ok();
        let pid = owner.trim().parse::<i32>().unwrap_or(0);
        error!(
            "Cannot create lock on core {}, probably process {} has claimed it",
            core, pid
        );
        return Err(CoreError::CoreClaimed { core, pid });
    }

    // record our pid so other processes trying to claim the same core know
    // what is holding the lock
    file.set_len(0)
        .and_then(|_| file.seek(SeekFrom::Start(0)).map(|_| ()))
        .and_then(|_| write!(file, "{}", std::process::id()))
        .map_err(|e| CoreError::CoreLockFile {
            path,
            source: e,
        })?;

    Ok(file)
}

/// Claim every owned core. On any conflict all already acquired claims are
/// released again and the offending core is reported.
pub fn claim_cpu_cores() -> Result<(), CoreError> {
    let mut locks = CORE_LOCKS.lock();
    for &core in Cores::list() {
        if locks.contains_key(&core) {
            continue;
        }
        match claim_core(core) {
            Ok(file) => {
                locks.insert(core, file);
            }
            Err(e) => {
                drop(locks);
                unclaim_cpu_cores();
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Release all claims and remove the lock files.
pub fn unclaim_cpu_cores() {
    let mut locks = CORE_LOCKS.lock();
    for (core, file) in locks.drain() {
        // dropping the descriptor releases the flock
        drop(file);
        if let Err(e) = std::fs::remove_file(lock_path(core)) {
            warn!("failed to remove lock file of core {}: {}", core, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_shows_owner() {
        let file = claim_core(125).unwrap();
        let content = std::fs::read_to_string(lock_path(125)).unwrap();
        assert_eq!(content, std::process::id().to_string());

        // a second flock within the same process would succeed, so check the
        // lock through a fresh descriptor state instead: the file stays until
        // explicitly unclaimed
        drop(file);
        std::fs::remove_file(lock_path(125)).unwrap();
    }
}
