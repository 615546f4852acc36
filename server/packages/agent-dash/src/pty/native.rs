//! `openpty` backend: the controlling side is driven by the tokio reactor.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, Winsize};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use super::{LaunchSpec, PtySize};

pub(super) type Controller = Arc<AsyncFd<OwnedFd>>;

pub(super) fn spawn(launch: &LaunchSpec, size: PtySize) -> io::Result<(Controller, Child)> {
    let (controller, subordinate) = open_pair(size)?;

    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .envs(launch.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::from(subordinate.try_clone()?))
        .stdout(Stdio::from(subordinate.try_clone()?))
        .stderr(Stdio::from(subordinate));
    if let Some(cwd) = &launch.cwd {
        command.current_dir(cwd);
    }
    if let Some(user) = &launch.run_as {
        command
            .uid(user.uid)
            .gid(user.gid)
            .envs(user.env())
            .current_dir(&user.home);
    }
    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            // stdin is already the subordinate side here.
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    // The parent's copies of the subordinate side must be gone, otherwise
    // reads never observe the child hanging up.
    drop(command);

    set_nonblocking(&controller)?;
    let controller = AsyncFd::with_interest(controller, Interest::READABLE.add(Interest::WRITABLE))?;
    Ok((Arc::new(controller), child))
}

fn open_pair(size: PtySize) -> io::Result<(OwnedFd, OwnedFd)> {
    let pair = openpty(&to_winsize(size), None)?;
    set_cloexec(&pair.master)?;
    set_cloexec(&pair.slave)?;
    // Some platforms ignore the openpty winsize argument.
    set_size(&pair.master, size)?;
    Ok((pair.master, pair.slave))
}

pub(super) async fn read(controller: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = controller.readable().await?;
        match guard.try_io(|fd| match nix::unistd::read(fd.get_ref(), buf) {
            // Linux reports a hung-up subordinate side as EIO.
            Err(Errno::EIO) => Ok(0),
            result => result.map_err(io::Error::from),
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

pub(super) async fn write_all(controller: &AsyncFd<OwnedFd>, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let mut guard = controller.writable().await?;
        match guard.try_io(|fd| nix::unistd::write(fd.get_ref(), data).map_err(io::Error::from)) {
            Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

pub(super) fn set_size(fd: &impl AsRawFd, size: PtySize) -> io::Result<()> {
    let winsize = to_winsize(size);
    // SAFETY: TIOCSWINSZ reads one winsize from the pointer.
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn to_winsize(size: PtySize) -> Winsize {
    Winsize {
        ws_row: size.rows(),
        ws_col: size.cols(),
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_cloexec(fd: &impl AsFd) -> io::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd.as_fd(), FcntlArg::F_GETFD)?);
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn set_nonblocking(fd: &impl AsFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
