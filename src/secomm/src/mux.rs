use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::ChannelError;

/// Readiness multiplexer over a set of channels (or any fd-backed source).
///
/// A single thread registers `(token, fd)` pairs and waits with a bounded
/// timeout; the wait returns the tokens readable right now. An empty result
/// is a timeout, not a failure.
#[derive(Default)]
pub struct ChannelMux {
    entries: Vec<(u64, RawFd)>,
}

impl ChannelMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, token: u64, source: &impl AsRawFd) {
        self.entries.push((token, source.as_raw_fd()));
    }

    pub fn unregister(&mut self, token: u64) {
        self.entries.retain(|(t, _)| *t != token);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait up to `timeout_ms` for readability; returns the ready tokens.
    /// Hangups and errors count as ready so the owner observes them on the
    /// next read and tears the session down.
    pub fn wait(&self, timeout_ms: u16) -> Result<Vec<u64>, ChannelError> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut fds: Vec<PollFd> = self
            .entries
            .iter()
            .map(|(_, fd)| {
                PollFd::new(
                    // entries hold fds of sources registered by the caller;
                    // the caller keeps them open across the wait
                    unsafe { BorrowedFd::borrow_raw(*fd) },
                    PollFlags::POLLIN,
                )
            })
            .collect();

        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(_) => {}
            // interrupted by a signal: report an empty ready set so the
            // caller's loop head can observe its shutdown flag
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(ChannelError::Io(e.into())),
        }

        let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        Ok(self
            .entries
            .iter()
            .zip(fds.iter())
            .filter(|(_, pfd)| {
                pfd.revents()
                    .map(|ev| ev.intersects(ready))
                    .unwrap_or(false)
            })
            .map(|((token, _), _)| *token)
            .collect())
    }
}
