//! Descriptor transport: payload + open descriptors over a Unix socket.
//!
//! This is the leaf primitive everything else builds on. A request travels
//! as one `sendmsg(2)` call carrying the encoded Request Envelope in the
//! data portion and up to [`MAX_FDS`] descriptors as SCM_RIGHTS ancillary
//! data. The kernel duplicates each descriptor into the receiving process:
//! the receiver's copies are independent handles onto the same open file
//! descriptions, so closing the sender's originals does not invalidate them.
//!
//! `O_CLOEXEC` is process-scoped; it does **not** block `SCM_RIGHTS`
//! transfers, so no special handling is required for cloexec-flagged fds.
//!
//! Received descriptors materialize as [`OwnedFd`]: ownership transfers to
//! the caller and each fd closes exactly once, on drop, on every exit path.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use anyhow::{bail, Context, Result};

/// Protocol arity: every request carries exactly three descriptors.
pub const MAX_FDS: usize = 3;

/// Upper bound on the payload accepted in a single message.
///
/// The Request Envelope is tens of bytes; 64 KB is generous headroom while
/// still fitting comfortably in one datagram-sized stream write.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Send `payload` with `fds` attached via `sendmsg` + SCM_RIGHTS.
///
/// At most [`MAX_FDS`] descriptors per message; the payload must not exceed
/// [`MAX_PAYLOAD`]. The sender keeps its own copies of the descriptors and
/// is expected to close them after the handoff.
pub fn send_fds(stream: &UnixStream, payload: &[u8], fds: &[BorrowedFd<'_>]) -> Result<()> {
    if fds.len() > MAX_FDS {
        bail!("too many descriptors for one message: {} > {MAX_FDS}", fds.len());
    }
    if payload.len() > MAX_PAYLOAD {
        bail!("payload too large: {} > {MAX_PAYLOAD}", payload.len());
    }

    let sock_fd = stream.as_raw_fd();
    let fd_bytes = fds.len() * std::mem::size_of::<libc::c_int>();
    // CMSG_SPACE includes the cmsghdr header overhead.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: if fds.is_empty() {
            std::ptr::null_mut()
        } else {
            cmsg_buf.as_mut_ptr() as *mut libc::c_void
        },
        msg_controllen: if fds.is_empty() { 0 } else { cmsg_space as _ },
        msg_flags: 0,
    };

    if !fds.is_empty() {
        // Populate cmsghdr with SOL_SOCKET / SCM_RIGHTS and the fd values.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
            let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
            for (i, fd) in fds.iter().enumerate() {
                std::ptr::write_unaligned(data_ptr.add(i), fd.as_raw_fd());
            }
        }
    }

    loop {
        let n = unsafe { libc::sendmsg(sock_fd, &msg, 0) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err).context("sendmsg with SCM_RIGHTS");
        }
    }
}

/// Receive one message from `stream`, capturing any SCM_RIGHTS descriptors.
///
/// Returns `(payload, fds)`. An empty payload with no descriptors means the
/// peer closed the connection. The returned [`OwnedFd`]s belong to the
/// caller; dropping them is the close.
pub fn recv_fds(stream: &UnixStream) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
    let sock_fd = stream.as_raw_fd();
    let mut data_buf = vec![0u8; MAX_PAYLOAD];
    let fd_bytes = MAX_FDS * std::mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: data_buf.len(),
    };
    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    let n = loop {
        let n = unsafe { libc::recvmsg(sock_fd, &mut msg, 0) };
        if n >= 0 {
            break n;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err).context("recvmsg with SCM_RIGHTS");
        }
    };
    data_buf.truncate(n as usize);

    // Extract fds from ancillary data. Taking ownership immediately means
    // every received descriptor gets closed even if decoding fails later.
    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / std::mem::size_of::<libc::c_int>();
                for i in 0..count {
                    let fd: libc::c_int = std::ptr::read_unaligned(
                        data.add(i * std::mem::size_of::<libc::c_int>()) as *const libc::c_int,
                    );
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((data_buf, fds))
}

/// A request's descriptor set, recovered from ancillary data with the
/// protocol's fixed arity already enforced.
///
/// Consuming the struct is the only way to reach the descriptors, so each
/// one has exactly one owner from here on.
#[derive(Debug)]
pub struct DescriptorSet {
    fds: [OwnedFd; MAX_FDS],
}

impl DescriptorSet {
    /// Validate arity and take ownership of the received descriptors.
    pub fn from_received(fds: Vec<OwnedFd>) -> Result<Self> {
        if fds.len() != MAX_FDS {
            bail!("descriptor arity mismatch: got {}, expected {MAX_FDS}", fds.len());
        }
        let mut it = fds.into_iter();
        Ok(Self {
            // Arity checked above; unwraps cannot fire.
            fds: [
                it.next().expect("arity checked"),
                it.next().expect("arity checked"),
                it.next().expect("arity checked"),
            ],
        })
    }

    /// Split into (stdin, stdout, stderr) for Connect, or
    /// (local source, local sink, unused) for Forward.
    pub fn into_parts(self) -> (OwnedFd, OwnedFd, OwnedFd) {
        let [a, b, c] = self.fds;
        (a, b, c)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsFd;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds: [libc::c_int; 2] = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    /// Payload and all three descriptors survive one sendmsg/recvmsg pair,
    /// and each received descriptor refers to the sender's open file.
    #[test]
    fn three_fds_pass_through_scm_rights() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (r0, w0) = pipe_pair();
        let (r1, w1) = pipe_pair();
        let (r2, w2) = pipe_pair();

        send_fds(&tx, b"envelope-bytes", &[r0.as_fd(), r1.as_fd(), r2.as_fd()]).unwrap();

        let (payload, fds) = recv_fds(&rx).unwrap();
        assert_eq!(&payload, b"envelope-bytes");
        assert_eq!(fds.len(), 3);

        // Write through the sender's write ends; read through the received
        // duplicates, in order.
        for (i, (w, fd)) in [w0, w1, w2].into_iter().zip(&fds).enumerate() {
            let msg = format!("pipe-{i}");
            let mut wf = std::fs::File::from(w);
            wf.write_all(msg.as_bytes()).unwrap();
            drop(wf);

            let mut buf = vec![0u8; msg.len()];
            let mut rf = std::fs::File::from(fd.try_clone().unwrap());
            rf.read_exact(&mut buf).unwrap();
            assert_eq!(buf, msg.as_bytes());
        }
    }

    /// The kernel duplicates descriptors into the receiver; closing the
    /// sender's original must not invalidate the received copy.
    #[test]
    fn received_fd_survives_sender_close() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (r, w) = pipe_pair();

        send_fds(&tx, b"x", &[r.as_fd()]).unwrap();
        drop(r); // sender closes its copy after the handoff

        let (_payload, mut fds) = recv_fds(&rx).unwrap();
        let received = fds.pop().unwrap();

        let mut wf = std::fs::File::from(w);
        wf.write_all(b"independent copy").unwrap();
        drop(wf);

        let mut buf = Vec::new();
        std::fs::File::from(received).read_to_end(&mut buf).unwrap();
        assert_eq!(&buf, b"independent copy");
    }

    #[test]
    fn arity_is_enforced() {
        let (r, _w) = pipe_pair();
        let err = DescriptorSet::from_received(vec![r]).unwrap_err();
        assert!(err.to_string().contains("arity"));

        let too_many: Vec<OwnedFd> = (0..4).map(|_| pipe_pair().0).collect();
        assert!(DescriptorSet::from_received(too_many).is_err());
    }

    #[test]
    fn rejects_more_than_three_fds_on_send() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        let pipes: Vec<(OwnedFd, OwnedFd)> = (0..4).map(|_| pipe_pair()).collect();
        let borrowed: Vec<_> = pipes.iter().map(|(r, _)| r.as_fd()).collect();
        assert!(send_fds(&tx, b"", &borrowed).is_err());
    }

    /// Peer close reads back as empty payload with no descriptors.
    #[test]
    fn peer_close_reads_as_empty() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        let (payload, fds) = recv_fds(&rx).unwrap();
        assert!(payload.is_empty());
        assert!(fds.is_empty());
    }
}
