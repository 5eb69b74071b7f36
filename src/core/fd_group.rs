//!
//! A waitable group of file descriptors with per-fd callbacks, built on
//! epoll. Groups compose by nesting: a child group's epoll fd is registered
//! inside the parent, so a single `wait` on the parent observes readiness of
//! every descriptor in the whole tree. While a child is nested it must only
//! be driven through its parent.

use std::{
    collections::HashMap,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Arc,
};

use nix::errno::Errno;
use parking_lot::Mutex;

use crate::core::CoreError;

/// How the group treats the descriptor around dispatch. Eventfds are drained
/// before the callback runs so an edge is consumed exactly once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FdType {
    Eventfd,
    Generic,
}

type FdHandler = Box<dyn Fn() -> i32 + Send + Sync>;

enum Registration {
    Callback {
        name: String,
        fd_type: FdType,
        handler: FdHandler,
    },
    Nested(Arc<FdGroup>),
}

pub struct FdGroup {
    name: String,
    epfd: OwnedFd,
    registrations: Mutex<HashMap<RawFd, Arc<Registration>>>,
}

impl FdGroup {
    pub fn create(name: &str) -> Result<Arc<Self>, CoreError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(CoreError::FdGroupCreate {
                name: name.to_owned(),
                source: Errno::last(),
            });
        }
        Ok(Arc::new(Self {
            name: name.to_owned(),
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            registrations: Mutex::new(HashMap::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn epoll_add(&self, fd: RawFd) -> Result<(), CoreError> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) }
            != 0
        {
            return Err(CoreError::FdGroupAdd {
                fd,
                source: Errno::last(),
            });
        }
        Ok(())
    }

    fn epoll_del(&self, fd: RawFd) {
        if unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        } != 0
        {
            warn!(
                "fd group '{}': failed to remove fd {}: {}",
                self.name,
                fd,
                Errno::last()
            );
        }
    }

    /// Register a descriptor with its readiness callback.
    pub fn add_fd<F>(
        &self,
        fd: RawFd,
        name: &str,
        fd_type: FdType,
        handler: F,
    ) -> Result<(), CoreError>
    where
        F: Fn() -> i32 + Send + Sync + 'static,
    {
        self.epoll_add(fd)?;
        self.registrations.lock().insert(
            fd,
            Arc::new(Registration::Callback {
                name: name.to_owned(),
                fd_type,
                handler: Box::new(handler),
            }),
        );
        Ok(())
    }

    pub fn remove_fd(&self, fd: RawFd) -> Result<(), CoreError> {
        match self.registrations.lock().remove(&fd) {
            Some(_) => {
                self.epoll_del(fd);
                Ok(())
            }
            None => Err(CoreError::FdGroupRemove { fd }),
        }
    }

    /// Nest a child group: the parent wait will dispatch into the child when
    /// any of the child's descriptors become ready.
    pub fn nest(&self, child: Arc<FdGroup>) -> Result<(), CoreError> {
        let fd = child.epfd.as_raw_fd();
        self.epoll_add(fd)?;
        self.registrations
            .lock()
            .insert(fd, Arc::new(Registration::Nested(child)));
        Ok(())
    }

    pub fn unnest(&self, child: &FdGroup) -> Result<(), CoreError> {
        self.remove_fd(child.epfd.as_raw_fd())
    }

    /// Wait for readiness and dispatch callbacks. A negative timeout blocks
    /// until at least one descriptor fires. Returns the number of callbacks
    /// dispatched.
    pub fn wait(&self, timeout_ms: i32) -> Result<usize, CoreError> {
        const MAX_EVENTS: usize = 32;

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if rc < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                return Ok(0);
            }
            return Err(CoreError::FdGroupWait { source: errno });
        }

        let mut dispatched = 0;
        for event in events.iter().take(rc as usize) {
            let fd = event.u64 as RawFd;
            // the registration may be pulled out by a previous callback,
            // resolve each one afresh and never dispatch under the lock
            let registration = self.registrations.lock().get(&fd).cloned();
            match registration.as_deref() {
                Some(Registration::Callback {
                    fd_type, handler, ..
                }) => {
                    if *fd_type == FdType::Eventfd {
                        drain_eventfd(fd);
                    }
                    handler();
                    dispatched += 1;
                }
                Some(Registration::Nested(child)) => {
                    dispatched += child.wait(0)?;
                }
                None => {}
            }
        }

        Ok(dispatched)
    }
}

impl AsRawFd for FdGroup {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}

impl std::fmt::Debug for FdGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FdGroup")
            .field("name", &self.name)
            .field("epfd", &self.epfd.as_raw_fd())
            .field("fds", &self.registrations.lock().len())
            .finish()
    }
}

/// Create a non-blocking eventfd for wake-up style notifications.
pub fn eventfd() -> Result<OwnedFd, CoreError> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(CoreError::EventFd {
            source: Errno::last(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Write a wake-up token to an eventfd. Failures are logged and swallowed: a
/// missed wake is recoverable by construction of the notification protocol.
pub fn eventfd_write(fd: RawFd, what: &str) {
    let notify: u64 = 1;
    let rc = unsafe {
        libc::write(
            fd,
            &notify as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if rc < 0 {
        error!("failed to notify {}: {}", what, Errno::last());
    }
}

fn drain_eventfd(fd: RawFd) {
    let mut value: u64 = 0;
    unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn dispatch_and_drain() {
        let grp = FdGroup::create("ut").unwrap();
        let efd = eventfd().unwrap();
        let hits = Arc::new(AtomicU32::new(0));

        let counted = hits.clone();
        grp.add_fd(efd.as_raw_fd(), "wake", FdType::Eventfd, move || {
            counted.fetch_add(1, Ordering::SeqCst);
            1
        })
        .unwrap();

        assert_eq!(grp.wait(0).unwrap(), 0);

        eventfd_write(efd.as_raw_fd(), "ut");
        assert_eq!(grp.wait(0).unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // the edge was consumed by the dispatch above
        assert_eq!(grp.wait(0).unwrap(), 0);
    }

    #[test]
    fn nested_group_wakes_parent() {
        let parent = FdGroup::create("parent").unwrap();
        let child = FdGroup::create("child").unwrap();
        let efd = eventfd().unwrap();
        let hits = Arc::new(AtomicU32::new(0));

        let counted = hits.clone();
        child
            .add_fd(efd.as_raw_fd(), "wake", FdType::Eventfd, move || {
                counted.fetch_add(1, Ordering::SeqCst);
                1
            })
            .unwrap();
        parent.nest(child.clone()).unwrap();

        eventfd_write(efd.as_raw_fd(), "ut");
        assert_eq!(parent.wait(100).unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        parent.unnest(&child).unwrap();
        eventfd_write(efd.as_raw_fd(), "ut");
        assert_eq!(parent.wait(0).unwrap(), 0);
        assert_eq!(child.wait(0).unwrap(), 1);
    }

    #[test]
    fn remove_unknown_fd() {
        let grp = FdGroup::create("ut").unwrap();
        assert!(grp.remove_fd(12345).is_err());
    }
}
