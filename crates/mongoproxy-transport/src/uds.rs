use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::ProxyStream;

/// `sockaddr_un.sun_path` capacity.
#[cfg(target_os = "linux")]
const SUN_PATH_CAPACITY: usize = 108;
#[cfg(not(target_os = "linux"))]
const SUN_PATH_CAPACITY: usize = 104;

/// Device and inode of the socket file this listener created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

/// Listener on a filesystem socket, next to (or instead of) TCP.
///
/// Database servers conventionally expose `/tmp/mongodb-<port>.sock`; the
/// proxy can offer the same. The socket file is removed on drop unless
/// something else has replaced it in the meantime.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    identity: FileIdentity,
}

impl UnixDomainSocket {
    pub const DEFAULT_SOCKET_MODE: u32 = 0o700;

    /// Bind with [`Self::DEFAULT_SOCKET_MODE`].
    ///
    /// A leftover socket file at `path` is replaced; any other kind of file
    /// is an error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = path.as_os_str().len();
        if len >= SUN_PATH_CAPACITY {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: SUN_PATH_CAPACITY,
            });
        }

        let bind_failed = |source: io::Error| TransportError::Bind {
            addr: path.display().to_string(),
            source,
        };

        clear_stale_socket(&path).map_err(bind_failed)?;
        let listener = UnixListener::bind(&path).map_err(bind_failed)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_failed)?;
        let identity = std::fs::symlink_metadata(&path)
            .map(|metadata| FileIdentity::of(&metadata))
            .map_err(bind_failed)?;

        info!(path = %path.display(), mode = format!("{mode:o}"), "listening on unix socket");
        Ok(Self {
            listener,
            path,
            identity,
        })
    }

    pub fn accept(&self) -> Result<ProxyStream> {
        let (stream, _) = self.listener.accept().map_err(TransportError::Accept)?;
        Ok(ProxyStream::from_unix(stream))
    }

    pub fn connect(path: impl AsRef<Path>) -> Result<ProxyStream> {
        let path = path.as_ref();
        UnixStream::connect(path)
            .map(ProxyStream::from_unix)
            .map_err(|source| TransportError::Connect {
                addr: path.display().to_string(),
                source,
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn clear_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        ));
    }
    debug!(path = %path.display(), "replacing stale socket");
    std::fs::remove_file(path)
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let still_ours = std::fs::symlink_metadata(&self.path).is_ok_and(|metadata| {
            metadata.file_type().is_socket() && FileIdentity::of(&metadata) == self.identity
        });
        if still_ours {
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = %self.path.display(), "socket file replaced, leaving it in place");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mongoproxy-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn accepts_clients_and_removes_file_on_drop() {
        let dir = scratch_dir("uds");
        let path = dir.join("mongodb-27017.sock");

        let listener = UnixDomainSocket::bind(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);

        let client_path = path.clone();
        let client = std::thread::spawn(move || {
            let mut stream = UnixDomainSocket::connect(&client_path).unwrap();
            stream.write_all(b"ping").unwrap();
        });
        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        client.join().unwrap();

        drop(listener);
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = scratch_dir("uds-stale");
        let path = dir.join("stale.sock");
        // A bare listener leaves its file behind when dropped.
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = UnixDomainSocket::bind(&path).unwrap();
        assert_eq!(listener.path(), path.as_path());
        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn regular_file_blocks_bind() {
        let dir = scratch_dir("uds-file");
        let path = dir.join("not-a-socket.sock");
        std::fs::write(&path, b"data").unwrap();

        let result = UnixDomainSocket::bind(&path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn overlong_path_is_rejected() {
        let path = format!("/tmp/{}.sock", "m".repeat(200));
        let result = UnixDomainSocket::bind(&path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }
}
