//! Unix socket listener and the level-triggered poll loop driving `TelemCore`.

use std::io::{self, ErrorKind};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use telem_core::identity::{self, MachineIdSource, MachineIdStore, RefreshOutcome};
use telem_core::{Readiness, RecordProcessor, Stager, TelemCore};
use tracing::{debug, error, info};

use crate::config::Config;

/// Upper bound on one poll wait, so a shutdown request is noticed promptly.
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    core: TelemCore<UnixStream>,
    refresh_every: Duration,
    last_refresh: Instant,
}

impl Server {
    /// Prepare the spool dir and machine id, then bind the listening socket.
    pub fn bind(cfg: &Config) -> Result<Self> {
        std::fs::create_dir_all(&cfg.spool_dir)
            .with_context(|| format!("failed to create spool dir {}", cfg.spool_dir.display()))?;

        let store = MachineIdStore::new(&cfg.machine_id_file, cfg.machine_id_expiry());
        refresh_machine_id(&store);
        let override_id = identity::read_override(&cfg.machine_id_override_file);
        if override_id.is_some() {
            info!("using static machine id override");
        }
        let processor = RecordProcessor::new(
            cfg.headers.clone(),
            Stager::new(&cfg.spool_dir),
            MachineIdSource::new(store, override_id),
        );

        let listener = bind_socket(&cfg.socket_path)?;
        info!(socket = %cfg.socket_path.display(), spool = %cfg.spool_dir.display(), "listening");
        Ok(Self {
            listener,
            socket_path: cfg.socket_path.clone(),
            core: TelemCore::new(processor).with_frame_timeout(cfg.read_timeout()),
            refresh_every: cfg.machine_id_refresh(),
            last_refresh: Instant::now(),
        })
    }

    #[cfg(test)]
    pub fn core(&self) -> &TelemCore<UnixStream> {
        &self.core
    }

    /// Serve until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.run_once(MAX_POLL_WAIT)?;
        }
        info!(clients = self.core.table().len(), "shutting down");
        self.core.table_mut().clear();
        Ok(())
    }

    /// One wait plus the work it reports: readable clients first, then new connections.
    pub fn run_once(&mut self, max_wait: Duration) -> Result<()> {
        if self.last_refresh.elapsed() >= self.refresh_every {
            refresh_machine_id(self.core.processor().machine_id().store());
            self.last_refresh = Instant::now();
        }

        let mut fds = Vec::with_capacity(self.core.table().len() + 1);
        fds.push(pollfd(self.listener.as_raw_fd(), libc::POLLIN));
        for entry in self.core.table().iter() {
            fds.push(pollfd(entry.stream.as_raw_fd(), interest_events(entry.interest)));
        }

        let wait = self
            .refresh_every
            .saturating_sub(self.last_refresh.elapsed())
            .min(max_wait);
        match poll(&mut fds, wait) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e).context("poll failed"),
        }

        // Serving a client removes it; walk down so lower indices stay valid.
        for i in (0..self.core.table().len()).rev() {
            let revents = fds[i + 1].revents;
            if revents == 0 {
                continue;
            }
            self.core.table_mut().set_observed(i, readiness(revents));
            self.core.on_readable(i);
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.accept_pending();
        }
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        error!("failed to configure client socket: {e}");
                        continue;
                    }
                    self.core.on_accept(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("failed to accept client: {e}");
                    break;
                }
            }
        }
    }

}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("failed to remove socket {}: {e}", self.socket_path.display());
        }
    }
}

fn refresh_machine_id(store: &MachineIdStore) {
    match store.refresh_if_needed() {
        Ok(RefreshOutcome::Fresh) => {}
        Ok(RefreshOutcome::Created(_) | RefreshOutcome::Regenerated(_)) => {
            info!(path = %store.path().display(), "machine id updated");
        }
        Err(e) => error!("{e}"),
    }
}

fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind socket {}", path.display()))?;
    // Any local process may submit records.
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    }
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn pollfd(fd: libc::c_int, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn interest_events(interest: Readiness) -> libc::c_short {
    if interest.contains(Readiness::READABLE) {
        libc::POLLIN
    } else {
        0
    }
}

fn readiness(revents: libc::c_short) -> Readiness {
    let mut r = Readiness::NONE;
    if revents & libc::POLLIN != 0 {
        r = r | Readiness::READABLE;
    }
    if revents & libc::POLLHUP != 0 {
        r = r | Readiness::HANGUP;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        r = r | Readiness::ERROR;
    }
    r
}

fn poll(fds: &mut [libc::pollfd], wait: Duration) -> io::Result<usize> {
    let ms = wait.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `fds` is a valid, exclusively borrowed array of `fds.len()` pollfd entries.
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use telem_core::protocol::{DEFAULT_HEADERS, MACHINE_ID_HEADER};
    use telem_core::wire::{encode_frame, format_header_block};

    fn config(dir: &Path) -> Config {
        Config {
            socket_path: dir.join("run/telem.sock"),
            spool_dir: dir.join("spool"),
            machine_id_file: dir.join("state/machine_id"),
            machine_id_override_file: dir.join("override"),
            ..Config::default()
        }
    }

    fn frame() -> Vec<u8> {
        let block = format_header_block(DEFAULT_HEADERS.iter().map(|n| {
            let v = if *n == MACHINE_ID_HEADER { "PLACEHOLDER" } else { "v" };
            (*n, v)
        }));
        encode_frame(None, &block, b"hello").unwrap()
    }

    fn spool_files(cfg: &Config) -> Vec<PathBuf> {
        std::fs::read_dir(&cfg.spool_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    fn drive(server: &mut Server, rounds: usize) {
        for _ in 0..rounds {
            server.run_once(Duration::from_millis(200)).unwrap();
        }
    }

    #[test]
    fn bind_prepares_spool_and_machine_id() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let server = Server::bind(&cfg).unwrap();
        assert!(cfg.spool_dir.is_dir());
        assert_eq!(std::fs::read_to_string(&cfg.machine_id_file).unwrap().len(), 32);
        assert!(cfg.socket_path.exists());
        drop(server);
        assert!(!cfg.socket_path.exists());
    }

    #[test]
    fn stages_record_from_socket_client() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut server = Server::bind(&cfg).unwrap();
        let id = std::fs::read_to_string(&cfg.machine_id_file).unwrap();

        let mut client = UnixStream::connect(&cfg.socket_path).unwrap();
        client.write_all(&frame()).unwrap();
        drop(client);
        drive(&mut server, 3);

        let files = spool_files(&cfg);
        assert_eq!(files.len(), 1);
        let text = std::fs::read_to_string(&files[0]).unwrap();
        assert!(text.contains(&format!("machine_id: {id}\n")));
        assert!(text.ends_with("hello\n"));
        assert!(server.core().table().is_empty());
    }

    #[test]
    fn trickling_client_is_dropped_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            read_timeout_secs: 1,
            ..config(dir.path())
        };
        let mut server = Server::bind(&cfg).unwrap();

        let mut client = UnixStream::connect(&cfg.socket_path).unwrap();
        let bytes = frame();
        client.write_all(&bytes[..1]).unwrap();
        let writer = std::thread::spawn(move || {
            for b in &bytes[1..] {
                std::thread::sleep(Duration::from_millis(50));
                if client.write_all(&[*b]).is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        drive(&mut server, 3);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(spool_files(&cfg).is_empty());
        assert!(server.core().table().is_empty());
        writer.join().unwrap();
    }

    #[test]
    fn rejected_size_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut server = Server::bind(&cfg).unwrap();

        let mut client = UnixStream::connect(&cfg.socket_path).unwrap();
        client.write_all(&4u32.to_le_bytes()).unwrap();
        drive(&mut server, 3);

        assert!(spool_files(&cfg).is_empty());
        assert!(server.core().table().is_empty());
        drop(client);
    }

    #[test]
    fn override_file_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        std::fs::write(&cfg.machine_id_override_file, "static-host-id\n").unwrap();
        let mut server = Server::bind(&cfg).unwrap();

        let mut client = UnixStream::connect(&cfg.socket_path).unwrap();
        client.write_all(&frame()).unwrap();
        drop(client);
        drive(&mut server, 3);

        let files = spool_files(&cfg);
        assert_eq!(files.len(), 1);
        let text = std::fs::read_to_string(&files[0]).unwrap();
        assert!(text.contains("machine_id: static-host-id\n"));
    }

    #[test]
    fn readiness_maps_poll_bits() {
        let r = readiness(libc::POLLIN | libc::POLLHUP);
        assert!(r.contains(Readiness::READABLE | Readiness::HANGUP));
        assert!(!r.contains(Readiness::ERROR));
        assert!(readiness(libc::POLLNVAL).contains(Readiness::ERROR));
        assert_eq!(interest_events(Readiness::READABLE), libc::POLLIN);
    }
}
