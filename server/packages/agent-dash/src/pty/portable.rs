//! `portable-pty` backend with a blocking reader thread.
//!
//! Used where `openpty` is unavailable (ConPTY on Windows) or when selected
//! explicitly. Identity demotion is not supported here.

use std::io::{self, Read};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty};
use tokio::sync::mpsc;

use super::{LaunchSpec, PtySize, READ_BUFFER_SIZE};

const OUTPUT_CHANNEL_CAPACITY: usize = 64;

pub(super) struct Spawned {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub writer: Box<dyn io::Write + Send>,
    pub master: Box<dyn MasterPty + Send>,
    pub child: Box<dyn portable_pty::Child + Send + Sync>,
}

pub(super) fn spawn(launch: &LaunchSpec, size: PtySize) -> io::Result<Spawned> {
    if let Some(user) = &launch.run_as {
        tracing::warn!(
            user = %user.name,
            "portable pty backend cannot switch identity; running as current user"
        );
    }

    let pair = native_pty_system()
        .openpty(to_portable(size))
        .map_err(io::Error::other)?;

    let mut cmd = CommandBuilder::new(&launch.program);
    cmd.args(&launch.args);
    for (key, value) in &launch.env {
        cmd.env(key, value);
    }
    let cwd = launch
        .cwd
        .clone()
        .or_else(|| launch.run_as.as_ref().map(|user| user.home.clone()));
    if let Some(cwd) = cwd {
        cmd.cwd(cwd);
    }

    let child = pair.slave.spawn_command(cmd).map_err(io::Error::other)?;
    // Hold no subordinate handle so the reader sees the child hang up.
    drop(pair.slave);

    let writer = pair.master.take_writer().map_err(io::Error::other)?;
    let reader = pair.master.try_clone_reader().map_err(io::Error::other)?;

    let (tx, output) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || pump_output(reader, tx))?;

    Ok(Spawned {
        output,
        writer,
        master: pair.master,
        child,
    })
}

fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "pty read ended");
                break;
            }
        }
    }
}

pub(super) fn resize(master: &dyn MasterPty, size: PtySize) -> io::Result<()> {
    master.resize(to_portable(size)).map_err(io::Error::other)
}

fn to_portable(size: PtySize) -> portable_pty::PtySize {
    portable_pty::PtySize {
        rows: size.rows(),
        cols: size.cols(),
        pixel_width: 0,
        pixel_height: 0,
    }
}
