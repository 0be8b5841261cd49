//! Thin wrappers over the kernel primitives the event-driven backend
//! rides on: eventfd (wake source), timerfd (timer source), epoll
//! (demultiplexer).
//!
//! All descriptors are created non-blocking and close-on-exec, and closed
//! on drop.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

fn last_err() -> io::Error {
    io::Error::last_os_error()
}

/// Wake source for a reactor's message inbox.
///
/// Coalescing: multiple `notify()` calls before the owner drains result
/// in a single wakeup (eventfd counter semantics).
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(last_err());
        }
        Ok(Self { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bump the counter. May be called from any thread.
    pub fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = last_err();
            // EAGAIN means the counter is saturated; a wakeup is already
            // pending, nothing lost.
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Consume pending wakeups. Returns the coalesced count, 0 if none.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// One-shot timerfd, rearmed by its owner on every expiry.
pub struct TimerFd {
    fd: RawFd,
}

impl TimerFd {
    pub fn create() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(last_err());
        }
        Ok(Self { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Arm for a single expiry `after` from now. A zero duration is
    /// clamped to 1ns, since an all-zero itimerspec would disarm instead.
    pub fn arm_oneshot(&self, after: Duration) -> io::Result<()> {
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = after.as_secs() as libc::time_t;
        spec.it_value.tv_nsec = after.subsec_nanos() as libc::c_long;
        if spec.it_value.tv_sec == 0 && spec.it_value.tv_nsec == 0 {
            spec.it_value.tv_nsec = 1;
        }
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(last_err());
        }
        Ok(())
    }

    pub fn disarm(&self) -> io::Result<()> {
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(last_err());
        }
        Ok(())
    }

    /// Consume the expiry count, 0 if the timer has not fired.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// The epoll instance a reactor multiplexes on. Tokens are the watched
/// descriptor itself.
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(last_err());
        }
        Ok(Self { fd })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(last_err());
        }
        Ok(())
    }

    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            return Err(last_err());
        }
        Ok(())
    }

    /// Wait for readiness. `timeout_ms` of -1 blocks. EINTR surfaces as
    /// `Ok(0)` so the caller's loop just re-enters.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let ret = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = last_err();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(ret as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_notify_drain() {
        let efd = EventFd::create().unwrap();
        assert_eq!(efd.drain(), 0);

        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.drain(), 2); // coalesced
        assert_eq!(efd.drain(), 0);
    }

    #[test]
    fn test_timerfd_fires() {
        let tfd = TimerFd::create().unwrap();
        tfd.arm_oneshot(Duration::from_millis(5)).unwrap();
        assert_eq!(tfd.drain(), 0);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tfd.drain(), 1);
    }

    #[test]
    fn test_timerfd_disarm() {
        let tfd = TimerFd::create().unwrap();
        tfd.arm_oneshot(Duration::from_millis(5)).unwrap();
        tfd.disarm().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tfd.drain(), 0);
    }

    #[test]
    fn test_epoll_wake_on_eventfd() {
        let ep = Epoll::create().unwrap();
        let efd = EventFd::create().unwrap();
        ep.add(efd.fd(), libc::EPOLLIN as u32).unwrap();

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 8];
        assert_eq!(ep.wait(&mut events, 0).unwrap(), 0);

        efd.notify().unwrap();
        let n = ep.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        let event_u64 = events[0].u64;
        assert_eq!(event_u64, efd.fd() as u64);
    }
}
