//! The well-known local endpoint: a unix domain socket, or a loopback TCP
//! port where unix sockets are unavailable.

use std::{
  ffi::OsString,
  fmt, io,
  net::{Ipv4Addr, SocketAddr},
  path::PathBuf,
};

use tokio::{
  io::{AsyncRead, AsyncWrite, BufReader},
  net::{TcpListener, TcpStream},
};

pub type Reader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
  #[cfg(unix)]
  Unix(PathBuf),
  /// A port on 127.0.0.1.
  Loopback(u16),
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      #[cfg(unix)]
      Self::Unix(path) => write!(f, "unix:{}", path.display()),
      Self::Loopback(port) => write!(f, "tcp:127.0.0.1:{port}"),
    }
  }
}

impl Endpoint {
  /// Path of the file locked by whichever process is becoming Master.
  pub fn master_lock_path(&self) -> PathBuf {
    match self {
      #[cfg(unix)]
      Self::Unix(path) => {
        let mut name = OsString::from(path.as_os_str());
        name.push(".master");
        PathBuf::from(name)
      }
      Self::Loopback(port) => std::env::temp_dir().join(format!("fstore-{port}.master")),
    }
  }

  pub async fn connect(&self) -> io::Result<(Reader, Writer)> {
    match self {
      #[cfg(unix)]
      Self::Unix(path) => {
        let (read, write) = tokio::net::UnixStream::connect(path).await?.into_split();
        Ok((BufReader::new(Box::new(read)), Box::new(write)))
      }
      Self::Loopback(port) => {
        let (read, write) = TcpStream::connect(loopback(*port)).await?.into_split();
        Ok((BufReader::new(Box::new(read)), Box::new(write)))
      }
    }
  }

  /// Bind the endpoint. A unix socket file left behind by a dead Master is
  /// removed first; the caller must already hold the master lock.
  pub(crate) async fn bind(&self) -> io::Result<Listener> {
    match self {
      #[cfg(unix)]
      Self::Unix(path) => {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
          tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(path).await {
          Ok(()) => tracing::info!(socket = %path.display(), "removed stale socket"),
          Err(err) if err.kind() == io::ErrorKind::NotFound => {}
          Err(err) => return Err(err),
        }
        Ok(Listener::Unix(tokio::net::UnixListener::bind(path)?, path.clone()))
      }
      Self::Loopback(port) => Ok(Listener::Loopback(TcpListener::bind(loopback(*port)).await?)),
    }
  }
}

fn loopback(port: u16) -> SocketAddr { SocketAddr::from((Ipv4Addr::LOCALHOST, port)) }

pub(crate) enum Listener {
  #[cfg(unix)]
  Unix(tokio::net::UnixListener, PathBuf),
  Loopback(TcpListener),
}

impl Listener {
  pub(crate) async fn accept(&self) -> io::Result<(Reader, Writer)> {
    match self {
      #[cfg(unix)]
      Self::Unix(listener, _) => {
        let (stream, _) = listener.accept().await?;
        let (read, write) = stream.into_split();
        Ok((BufReader::new(Box::new(read)), Box::new(write)))
      }
      Self::Loopback(listener) => {
        let (stream, _) = listener.accept().await?;
        let (read, write) = stream.into_split();
        Ok((BufReader::new(Box::new(read)), Box::new(write)))
      }
    }
  }
}

impl Drop for Listener {
  fn drop(&mut self) {
    #[cfg(unix)]
    if let Self::Unix(_, path) = self {
      let _ = std::fs::remove_file(path);
    }
  }
}
