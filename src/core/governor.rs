//! CPU frequency governor plug-ins. The core only keeps the registry; when
//! and how the knobs are turned is up to the active scheduling policy.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::CoreError;

/// Platform frequency control for individual cores.
pub trait Governor: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn deinit(&self) {}

    fn get_core_curr_freq(&self, _lcore: u32) -> Result<u64, CoreError> {
        Err(CoreError::GovernorNotSupported {})
    }

    fn core_freq_up(&self, _lcore: u32) -> Result<(), CoreError> {
        Err(CoreError::GovernorNotSupported {})
    }

    fn core_freq_down(&self, _lcore: u32) -> Result<(), CoreError> {
        Err(CoreError::GovernorNotSupported {})
    }

    fn set_core_freq_max(&self, _lcore: u32) -> Result<(), CoreError> {
        Err(CoreError::GovernorNotSupported {})
    }
}

static GOVERNOR_LIST: Lazy<Mutex<Vec<&'static dyn Governor>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

static CURRENT_GOVERNOR: Lazy<Mutex<Option<&'static dyn Governor>>> =
    Lazy::new(|| Mutex::new(None));

/// Register a governor under its name. Names must be unique.
pub fn register(governor: Box<dyn Governor>) {
    let mut list = GOVERNOR_LIST.lock();
    if list.iter().any(|g| g.name() == governor.name()) {
        error!("governor named '{}' already registered", governor.name());
        return;
    }
    list.push(Box::leak(governor));
}

/// Select the active governor by name; `None` deselects. The new governor is
/// initialized before the old one is torn down, and a failing init keeps the
/// old one in place.
pub fn set(name: Option<&str>) -> Result<(), CoreError> {
    let mut current = CURRENT_GOVERNOR.lock();

    let name = match name {
        None => {
            if let Some(old) = current.take() {
                old.deinit();
            }
            return Ok(());
        }
        Some(name) => name,
    };

    let new = GOVERNOR_LIST
        .lock()
        .iter()
        .copied()
        .find(|g| g.name() == name)
        .ok_or(CoreError::GovernorNotFound {
            name: name.to_owned(),
        })?;

    if let Some(old) = *current {
        if old.name() == new.name() {
            return Ok(());
        }
    }

    new.init()?;
    if let Some(old) = current.take() {
        old.deinit();
    }
    *current = Some(new);
    Ok(())
}

pub fn get() -> Option<&'static dyn Governor> {
    *CURRENT_GOVERNOR.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullGovernor;

    impl Governor for NullGovernor {
        fn name(&self) -> &'static str {
            "ut_null"
        }
    }

    #[test]
    fn registry() {
        register(Box::new(NullGovernor));
        assert!(set(Some("ut_nonexistent")).is_err());

        set(Some("ut_null")).unwrap();
        let governor = get().unwrap();
        assert_eq!(governor.name(), "ut_null");
        assert!(governor.core_freq_up(0).is_err());

        set(None).unwrap();
        assert!(get().is_none());
    }
}
