//! Owned arrays of passed file descriptors.
//!
//! Descriptors received with a varlink message arrive in a
//! [`FileDescriptorArray`]. The array owns every entry: whatever is not
//! explicitly taken out with [`FileDescriptorArray::take`] is closed when the
//! array is dropped. Call parameters reference entries by index on the wire
//! and by raw descriptor number on the native side (see [`Fd`]).

use std::fmt;
use std::future::Future;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use serde_derive::{Deserialize, Serialize};

/// Native representation of a file descriptor inside call parameters.
///
/// On the wire the field carries an index into the message's descriptor
/// array; in a deserialized parameter struct it carries the raw descriptor
/// number. The descriptor stays owned by the [`FileDescriptorArray`] of the
/// call until taken.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Fd(pub RawFd);

impl Fd {
    pub fn raw(self) -> RawFd {
        self.0
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl From<RawFd> for Fd {
    fn from(fd: RawFd) -> Self {
        Fd(fd)
    }
}

impl<T: AsFd> From<&T> for Fd {
    fn from(fd: &T) -> Self {
        Fd(fd.as_fd().as_raw_fd())
    }
}

/// An ordered array of owned file descriptors attached to one message.
#[derive(Default)]
pub struct FileDescriptorArray {
    entries: Vec<Option<OwnedFd>>,
}

impl FileDescriptorArray {
    pub fn new() -> Self {
        FileDescriptorArray {
            entries: Vec::new(),
        }
    }

    pub fn from_fds(fds: Vec<OwnedFd>) -> Self {
        FileDescriptorArray {
            entries: fds.into_iter().map(Some).collect(),
        }
    }

    /// Number of slots, including already taken ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }

    /// Borrow the descriptor at `index` without transferring ownership.
    pub fn get(&self, index: usize) -> Option<BorrowedFd<'_>> {
        self.entries.get(index)?.as_ref().map(|fd| fd.as_fd())
    }

    /// Raw descriptor number at `index`, if the slot is still owned.
    pub fn raw(&self, index: usize) -> Option<RawFd> {
        self.entries.get(index)?.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Append a descriptor, returning its index.
    pub fn push(&mut self, fd: OwnedFd) -> usize {
        self.entries.push(Some(fd));
        self.entries.len() - 1
    }

    /// Transfer ownership of the descriptor at `index` to the caller.
    ///
    /// Returns `None` if the index is out of range or the slot was taken
    /// before. A taken descriptor is never closed by the array.
    pub fn take(&mut self, index: usize) -> Option<OwnedFd> {
        self.entries.get_mut(index)?.take()
    }

    /// Transfer ownership of the entry matching the raw descriptor number of
    /// `fd`, as found in a deserialized parameter struct.
    pub fn take_fd(&mut self, fd: Fd) -> Option<OwnedFd> {
        let index = self
            .entries
            .iter()
            .position(|e| e.as_ref().map(|f| f.as_raw_fd()) == Some(fd.raw()))?;
        self.take(index)
    }

    /// Keep the array alive until `fut` resolves, then close the remaining
    /// descriptors and yield the future's output.
    pub async fn retain_until<F: Future>(self, fut: F) -> F::Output {
        let output = fut.await;
        drop(self);
        output
    }
}

impl fmt::Debug for FileDescriptorArray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| e.as_ref().map(OwnedFd::as_raw_fd)))
            .finish()
    }
}

/// Descriptors compare by identity (raw descriptor number), not contents.
impl PartialEq for FileDescriptorArray {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| {
                    a.as_ref().map(OwnedFd::as_raw_fd) == b.as_ref().map(OwnedFd::as_raw_fd)
                })
    }
}

/// Duplicate a raw descriptor into an owned close-on-exec handle.
pub(crate) fn dup_raw(fd: RawFd) -> io::Result<OwnedFd> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    borrowed.try_clone_to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_fds() -> (OwnedFd, OwnedFd) {
        use std::os::fd::FromRawFd;
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn take_transfers_ownership_once() {
        let (r, w) = pipe_fds();
        let raw = r.as_raw_fd();
        let mut fds = FileDescriptorArray::from_fds(vec![r, w]);
        assert_eq!(fds.len(), 2);
        let taken = fds.take(0).expect("first take");
        assert_eq!(taken.as_raw_fd(), raw);
        assert!(fds.take(0).is_none());
        assert!(fds.take(7).is_none());
        assert!(fds.raw(0).is_none());
        assert!(fds.raw(1).is_some());
    }

    #[test]
    fn drop_closes_untaken_entries() {
        let (r, w) = pipe_fds();
        let (raw_r, raw_w) = (r.as_raw_fd(), w.as_raw_fd());
        let mut fds = FileDescriptorArray::from_fds(vec![r, w]);
        let kept = fds.take_fd(Fd(raw_w)).expect("take by raw fd");
        drop(fds);
        assert!(!fd_is_open(raw_r));
        assert!(fd_is_open(raw_w));
        drop(kept);
        assert!(!fd_is_open(raw_w));
    }

    #[tokio::test]
    async fn retain_until_defers_close() {
        let (r, w) = pipe_fds();
        let raw = r.as_raw_fd();
        drop(w);
        let fds = FileDescriptorArray::from_fds(vec![r]);
        let out = fds
            .retain_until(async {
                assert!(fd_is_open(raw));
                17
            })
            .await;
        assert_eq!(out, 17);
        assert!(!fd_is_open(raw));
    }
}
