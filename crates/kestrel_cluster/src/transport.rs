use std::fmt;
use std::io;
use std::task::{Context, Poll};

use tokio::net::TcpStream;

/// Non-blocking byte transport to one data node.
///
/// Reads and writes never block; readiness is awaited through the
/// `poll_*_ready` methods so one task can multiplex many sockets.
pub trait NodeSocket: Send + Sync + fmt::Debug {
    /// Read into `buf`. `Ok(0)` means the peer closed the stream;
    /// `ErrorKind::WouldBlock` means nothing is available yet.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl NodeSocket for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        TcpStream::poll_read_ready(self, cx)
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        TcpStream::poll_write_ready(self, cx)
    }
}
