//! An SFTP-backed [`Backend`]: the same sharded layout as [`super::fs`], but
//! over an `ssh2` session instead of the local filesystem (§6.1, §6.2).

use std::io::prelude::*;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ssh2::{RenameFlags, Session, Sftp};
use tracing::*;

use super::{Backend, Kind};
use crate::error::{Error, Result};

/// Holds the session alongside the channel it opened: `Sftp` only stays
/// usable as long as the `Session` it came from is alive.
struct Conn {
    sftp: Sftp,
    _session: Session,
}

pub struct SftpBackend {
    conn: Mutex<Conn>,
    base_path: PathBuf,
    location: String,
}

fn map_ssh_error(e: ssh2::Error, path: &Path) -> Error {
    if let ssh2::ErrorCode::SFTP(code) = e.code() {
        // SSH_FX_NO_SUCH_FILE
        if code == 2 {
            return Error::NotFound(path.display().to_string());
        }
    }
    Error::transport(e)
}

/// Parses `[user@]host[:port]/path`, the body of an `sftp://`/`sftp:` URL.
fn parse_location(rest: &str) -> Result<(String, String, u16, String)> {
    let (authority, path) = rest
        .split_once('/')
        .ok_or_else(|| Error::invalid("sftp location", "missing a path after the host"))?;

    let (user, hostport) = match authority.split_once('@') {
        Some((u, hp)) => (u.to_string(), hp),
        None => (
            std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
            authority,
        ),
    };
    let (host, port) = match hostport.split_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>()
                .map_err(|e| Error::invalid("sftp port", e))?,
        ),
        None => (hostport.to_string(), 22u16),
    };
    Ok((user, host, port, path.to_string()))
}

fn connect_session(user: &str, host: &str, port: u16) -> Result<Session> {
    let tcp = TcpStream::connect((host, port)).map_err(Error::from)?;
    let mut session = Session::new().map_err(Error::transport)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(Error::transport)?;

    // Agent auth is the only option we reach for: asking for a passphrase
    // interactively doesn't fit this library's layering (that belongs to
    // whatever front end calls it), and keys without a passphrase loaded in
    // an agent are the common case for unattended backup jobs anyway.
    session.userauth_agent(user).map_err(Error::transport)?;
    if !session.authenticated() {
        return Err(Error::transport(format!(
            "ssh-agent authentication for {user}@{host} failed"
        )));
    }
    Ok(session)
}

impl SftpBackend {
    pub fn connect(rest: &str) -> Result<Self> {
        let (user, host, port, path) = parse_location(rest)?;
        let session = connect_session(&user, &host, port)?;
        let sftp = session.sftp().map_err(Error::transport)?;
        if sftp.stat(Path::new(&path)).is_err() {
            return Err(Error::NotFound(path));
        }
        Ok(Self {
            conn: Mutex::new(Conn {
                sftp,
                _session: session,
            }),
            base_path: PathBuf::from(path),
            location: format!("sftp://{rest}"),
        })
    }

    /// Creates a fresh, empty repository directory tree over SFTP.
    pub fn initialize(rest: &str) -> Result<Self> {
        let (user, host, port, path) = parse_location(rest)?;
        let session = connect_session(&user, &host, port)?;
        let sftp = session.sftp().map_err(Error::transport)?;

        let base = Path::new(&path);
        if sftp.stat(base).is_ok() {
            return Err(Error::AlreadyExists(path));
        }
        sftp.mkdir(base, 0o755).map_err(Error::transport)?;
        for ns in ["keys", "index", "snapshots", "locks", "tmp"] {
            sftp.mkdir(&base.join(ns), 0o755).map_err(Error::transport)?;
        }
        let data = base.join("data");
        sftp.mkdir(&data, 0o755).map_err(Error::transport)?;
        for b in 0..=255u8 {
            sftp.mkdir(&data.join(format!("{b:02x}")), 0o755)
                .map_err(Error::transport)?;
        }

        Ok(Self {
            conn: Mutex::new(Conn {
                sftp,
                _session: session,
            }),
            base_path: base.to_path_buf(),
            location: format!("sftp://{rest}"),
        })
    }

    fn path_for(&self, kind: Kind, name: &str) -> PathBuf {
        self.base_path.join(super::shard(kind, name))
    }
}

impl Backend for SftpBackend {
    fn create(&self, kind: Kind, name: &str, bytes: &[u8]) -> Result<()> {
        let to = self.path_for(kind, name);
        let conn = self.conn.lock().unwrap();

        if conn.sftp.stat(&to).is_ok() {
            return Err(Error::AlreadyExists(to.display().to_string()));
        }

        let tmp = self
            .base_path
            .join("tmp")
            .join(format!("{name}.tmp-{}", std::process::id()));
        {
            let mut fh = conn.sftp.create(&tmp).map_err(|e| map_ssh_error(e, &tmp))?;
            fh.write_all(bytes)?;
        }
        match conn.sftp.rename(&tmp, &to, Some(RenameFlags::OVERWRITE)) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = conn.sftp.unlink(&tmp);
                Err(map_ssh_error(e, &to))
            }
        }
    }

    fn load(&self, kind: Kind, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let path = self.path_for(kind, name);
        let conn = self.conn.lock().unwrap();
        let mut fh = conn
            .sftp
            .open(&path)
            .map_err(|e| map_ssh_error(e, &path))?;

        if offset > 0 {
            fh.seek(std::io::SeekFrom::Start(offset))?;
        }
        let mut buf = Vec::new();
        if length == 0 {
            fh.read_to_end(&mut buf)?;
        } else {
            fh.take(length).read_to_end(&mut buf)?;
        }
        Ok(buf)
    }

    fn stat(&self, kind: Kind, name: &str) -> Result<u64> {
        let path = self.path_for(kind, name);
        let conn = self.conn.lock().unwrap();
        let st = conn
            .sftp
            .stat(&path)
            .map_err(|e| map_ssh_error(e, &path))?;
        st.size
            .ok_or_else(|| Error::transport(format!("{} has no reported size", path.display())))
    }

    fn test(&self, kind: Kind, name: &str) -> Result<bool> {
        let path = self.path_for(kind, name);
        let conn = self.conn.lock().unwrap();
        Ok(conn.sftp.stat(&path).is_ok())
    }

    fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        let path = self.path_for(kind, name);
        let conn = self.conn.lock().unwrap();
        conn.sftp.unlink(&path).map_err(|e| map_ssh_error(e, &path))
    }

    fn list(&self, kind: Kind) -> Result<Vec<String>> {
        let dir = self.base_path.join(kind.namespace());
        let conn = self.conn.lock().unwrap();

        let mut names = Vec::new();
        if kind == Kind::Pack {
            for b in 0..=255u8 {
                let bucket = dir.join(format!("{b:02x}"));
                if let Ok(entries) = conn.sftp.readdir(&bucket) {
                    for (path, _stat) in entries {
                        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                            names.push(name.to_string());
                        }
                    }
                }
            }
        } else if let Ok(entries) = conn.sftp.readdir(&dir) {
            for (path, _stat) in entries {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self) -> Result<()> {
        warn!("Deleting entire repository at {}", self.location());
        // `ssh2` has no recursive remove; walk the fixed set of namespaces
        // this backend itself created.
        let conn = self.conn.lock().unwrap();
        for kind in [Kind::Key, Kind::Index, Kind::Snapshot, Kind::Lock] {
            let dir = self.base_path.join(kind.namespace());
            if let Ok(entries) = conn.sftp.readdir(&dir) {
                for (path, _) in entries {
                    let _ = conn.sftp.unlink(&path);
                }
            }
            let _ = conn.sftp.rmdir(&dir);
        }
        let data = self.base_path.join("data");
        for b in 0..=255u8 {
            let bucket = data.join(format!("{b:02x}"));
            if let Ok(entries) = conn.sftp.readdir(&bucket) {
                for (path, _) in entries {
                    let _ = conn.sftp.unlink(&path);
                }
            }
            let _ = conn.sftp.rmdir(&bucket);
        }
        let _ = conn.sftp.rmdir(&data);
        let tmp = self.base_path.join("tmp");
        if let Ok(entries) = conn.sftp.readdir(&tmp) {
            for (path, _) in entries {
                let _ = conn.sftp.unlink(&path);
            }
        }
        let _ = conn.sftp.rmdir(&tmp);
        conn.sftp
            .rmdir(&self.base_path)
            .map_err(|e| map_ssh_error(e, &self.base_path))
    }

    fn location(&self) -> String {
        self.location.clone()
    }
}
