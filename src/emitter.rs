use crate::config::RunConfig;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::debug;

const SEND_BUFFER_BYTES: usize = 4 * 1024 * 1024;
/// Datagrams sent between deadline and interruption checks.
const SEND_CHUNK: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub failures: u64,
    /// Budget left over when the batch was cut short.
    pub unsent: u64,
    /// Set when the batch ended inside a run of consecutive failures at least
    /// as long as the degraded threshold.
    pub degraded: bool,
}

/// Fire-and-forget datagram sender bound to one destination.
pub struct DatagramEmitter {
    socket: UdpSocket,
    target: SocketAddr,
    payload: Bytes,
    degraded_after: u32,
    consecutive_failures: u32,
}

impl DatagramEmitter {
    /// Resolves the run's destination and opens a connected UDP socket
    /// towards it.
    pub async fn connect(config: &RunConfig, degraded_after: u32) -> io::Result<Self> {
        let port = u16::try_from(config.target_port)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "port out of range"))?;
        let mut last_err = None;
        // First resolved address we can actually open a socket for wins.
        for target in tokio::net::lookup_host((config.target_host.as_str(), port)).await? {
            match open_connected(target).await {
                Ok(socket) => {
                    return Ok(Self {
                        socket,
                        target,
                        payload: filler(config.packet_size),
                        degraded_after: degraded_after.max(1),
                        consecutive_failures: 0,
                    })
                }
                Err(e) => {
                    debug!(addr = %target, error = %e, "Skipping unusable address");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve", config.target_host),
            )
        }))
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Sends up to `count` datagrams. A failed send is counted and skipped.
    /// The batch is cut short once `deadline` passes or `interrupted` returns
    /// true; both are checked every [`SEND_CHUNK`] datagrams.
    pub async fn send_batch(
        &mut self,
        count: u64,
        deadline: Instant,
        mut interrupted: impl FnMut() -> bool,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let mut remaining = count;
        while remaining > 0 {
            if Instant::now() >= deadline || interrupted() {
                report.unsent = remaining;
                break;
            }
            let chunk = remaining.min(SEND_CHUNK);
            for _ in 0..chunk {
                match self.socket.send(&self.payload).await {
                    Ok(n) => {
                        report.packets_sent += 1;
                        report.bytes_sent += n as u64;
                        self.consecutive_failures = 0;
                    }
                    Err(e) => {
                        report.failures += 1;
                        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                        debug!(dest = %self.target, error = %e, "Datagram send failed");
                    }
                }
            }
            remaining -= chunk;
        }
        report.degraded = self.consecutive_failures >= self.degraded_after;
        report
    }
}

async fn open_connected(target: SocketAddr) -> io::Result<UdpSocket> {
    let socket = bind_for(target)?;
    socket.connect(target).await?;
    Ok(socket)
}

/// Socket of the destination's address family, on an ephemeral local port,
/// with a send buffer large enough for one tick's batch.
fn bind_for(target: SocketAddr) -> io::Result<UdpSocket> {
    let (domain, local): (socket2::Domain, SocketAddr) = if target.is_ipv4() {
        (socket2::Domain::IPV4, SocketAddr::from(([0, 0, 0, 0], 0)))
    } else {
        (socket2::Domain::IPV6, SocketAddr::from(([0u16; 8], 0)))
    };
    let socket = socket2::Socket::new(
        domain,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    // Best effort; the kernel may clamp it.
    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_BYTES) {
        debug!(error = %e, "Could not enlarge UDP send buffer");
    }
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

fn filler(len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(len);
    for i in 0..len {
        buf.put_u8((i % 256) as u8);
    }
    buf.freeze()
}
