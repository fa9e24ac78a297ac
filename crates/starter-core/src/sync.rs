//! Single-byte synchronization events over a socketpair. This is
//! deliberately not the richer serde_json message channel the choreographer
//! uses for structured handoffs elsewhere in the wider runtime family this
//! crate descends from — ordering between master/container/RPC server only
//! ever needs a wake-up, never a payload.

use std::os::fd::RawFd;

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::unistd::{read, write};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to create socketpair: {0}")]
    SocketPairFailed(nix::Error),
    #[error("peer closed the synchronization channel")]
    PeerClosed,
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

type Result<T> = std::result::Result<T, SyncError>;

/// Create a `SOCK_STREAM` socketpair with `CLOEXEC` set, matching the
/// master/container and master/RPC-server synchronization channels.
pub fn new_socketpair() -> Result<(RawFd, RawFd)> {
    socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(SyncError::SocketPairFailed)
}

/// Send a single wake-up byte.
pub fn send_event(fd: RawFd) -> Result<()> {
    let n = write(fd, &[1u8])?;
    if n != 1 {
        return Err(SyncError::PeerClosed);
    }
    Ok(())
}

/// Block until a single wake-up byte arrives. A zero-length read means the
/// peer's end was closed (it died) rather than that it sent anything.
pub fn wait_event(fd: RawFd) -> Result<()> {
    let mut buf = [0u8; 1];
    let n = read(fd, &mut buf)?;
    if n != 1 {
        return Err(SyncError::PeerClosed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::close;

    #[test]
    fn test_send_then_wait_succeeds() {
        let (a, b) = new_socketpair().unwrap();
        send_event(a).unwrap();
        wait_event(b).unwrap();
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn test_wait_after_peer_closed_fails() {
        let (a, b) = new_socketpair().unwrap();
        close(a).unwrap();
        let err = wait_event(b).unwrap_err();
        assert!(matches!(err, SyncError::PeerClosed));
        close(b).unwrap();
    }
}
