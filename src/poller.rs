//! Non-blocking I/O readiness polling for dispatcher loops.
//!
//! A thin epoll wrapper: components register file descriptors they own,
//! and the dispatcher polls with zero timeout once per loop iteration,
//! routing each readiness event to the registering component's `on_io`
//! hook. The poller never reads or writes the descriptors and never blocks;
//! descriptor lifetime stays with the registering component.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

/// Readiness interests for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    fn bits(self) -> u32 {
        let mut ev = libc::EPOLLRDHUP as u32;
        if self.readable {
            ev |= libc::EPOLLIN as u32;
        }
        if self.writable {
            ev |= libc::EPOLLOUT as u32;
        }
        ev
    }
}

/// One readiness event, attributed to the component that registered the
/// descriptor.
#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Peer closed or descriptor hung up.
    pub hangup: bool,
    /// Error condition reported by the kernel.
    pub error: bool,
    pub owner: usize,
}

const MAX_EVENTS: usize = 64;

/// Edge source of I/O readiness events for one dispatcher.
pub struct Poller {
    epfd: RawFd,
    owners: HashMap<RawFd, usize>,
    scratch: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            owners: HashMap::new(),
            scratch: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.map(Interest::bits).unwrap_or(0),
            u64: fd as u64,
        };
        let evp = if interest.is_some() {
            &mut ev
        } else {
            std::ptr::null_mut()
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, evp) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Registers a descriptor on behalf of the component at `owner`.
    pub fn add(&mut self, fd: RawFd, interest: Interest, owner: usize) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(interest))?;
        self.owners.insert(fd, owner);
        Ok(())
    }

    /// Changes the interest set of a registered descriptor.
    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    /// Unregisters a descriptor. The descriptor itself stays open.
    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)?;
        self.owners.remove(&fd);
        Ok(())
    }

    pub fn registered(&self) -> usize {
        self.owners.len()
    }

    /// Polls with zero timeout, appending ready events to `out`.
    pub fn poll(&mut self, out: &mut Vec<IoEvent>) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.scratch.as_mut_ptr(),
                self.scratch.len() as libc::c_int,
                0,
            )
        };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }

        for ev in &self.scratch[..n as usize] {
            let fd = ev.u64 as RawFd;
            let Some(&owner) = self.owners.get(&fd) else {
                continue; // raced with remove
            };
            out.push(IoEvent {
                fd,
                readable: ev.events & libc::EPOLLIN as u32 != 0,
                writable: ev.events & libc::EPOLLOUT as u32 != 0,
                hangup: ev.events & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0,
                error: ev.events & libc::EPOLLERR as u32 != 0,
                owner,
            });
        }
        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn readable_event_is_routed_to_owner() {
        let (rd, wr) = pipe();
        let mut poller = Poller::new().unwrap();
        poller.add(rd, Interest::READABLE, 3).unwrap();

        let mut events = Vec::new();
        poller.poll(&mut events).unwrap();
        assert!(events.is_empty(), "nothing written yet");

        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);

        poller.poll(&mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, rd);
        assert_eq!(events[0].owner, 3);
        assert!(events[0].readable);
        assert!(!events[0].hangup);

        close(rd);
        close(wr);
    }

    #[test]
    fn writable_event_on_empty_pipe() {
        let (rd, wr) = pipe();
        let mut poller = Poller::new().unwrap();
        poller.add(wr, Interest::WRITABLE, 0).unwrap();

        let mut events = Vec::new();
        poller.poll(&mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].writable);

        close(rd);
        close(wr);
    }

    #[test]
    fn hangup_is_reported_when_writer_closes() {
        let (rd, wr) = pipe();
        let mut poller = Poller::new().unwrap();
        poller.add(rd, Interest::READABLE, 1).unwrap();

        close(wr);

        let mut events = Vec::new();
        poller.poll(&mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].hangup);

        close(rd);
    }

    #[test]
    fn removed_descriptor_stops_reporting() {
        let (rd, wr) = pipe();
        let mut poller = Poller::new().unwrap();
        poller.add(rd, Interest::READABLE, 0).unwrap();
        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);

        poller.remove(rd).unwrap();
        assert_eq!(poller.registered(), 0);

        let mut events = Vec::new();
        poller.poll(&mut events).unwrap();
        assert!(events.is_empty());

        close(rd);
        close(wr);
    }
}
