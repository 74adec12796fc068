//! TCP and UDP front ends. A single cooperative task per TCP connection
//! parses lines and dispatches to the `Manager`, which pushes the actual
//! mmap/disk work onto the blocking pool; the network task itself never
//! touches a filter's memory directly.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, Duration};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::Result;
use crate::manager::Manager;
use crate::protocol::{Request, Response, MAX_LINE_BYTES};

const BACKOFF: u64 = 128;
const UDP_RECV_BUFFER_CANDIDATES: [usize; 4] = [4 * 1024 * 1024, 2 * 1024 * 1024, 1024 * 1024, 512 * 1024];

pub struct Server {
    tcp_listener: TcpListener,
    udp_socket: UdpSocket,
    manager: Arc<Manager>,
    backoff: u64,
}

impl Server {
    pub fn new(tcp_listener: TcpListener, udp_socket: UdpSocket, manager: Arc<Manager>) -> Self {
        Server {
            tcp_listener,
            udp_socket,
            manager,
            backoff: BACKOFF,
        }
    }

    /// Runs the TCP accept loop forever, spawning a UDP listener task
    /// alongside it.
    pub async fn run(mut self) -> Result<()> {
        let udp_manager = self.manager.clone();
        let udp_socket = self.udp_socket;
        tokio::spawn(async move {
            if let Err(e) = run_udp(udp_socket, udp_manager).await {
                tracing::error!(error = %e, "udp listener exited");
            }
        });

        loop {
            let stream = self.accept().await?;
            let manager = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_tcp_connection(stream, manager).await {
                    tracing::warn!(error = %e, "connection ended with error");
                }
            });
        }
    }

    /// Exponential backoff: 1s, 2s, 4s, ... giving up once the cumulative
    /// wait exceeds `self.backoff` seconds.
    async fn accept(&mut self) -> Result<TcpStream> {
        let mut backoff = 1;
        loop {
            match self.tcp_listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > self.backoff {
                        return Err(err.into());
                    }
                }
            }
            sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

async fn handle_tcp_connection(stream: TcpStream, manager: Arc<Manager>) -> Result<()> {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(result) = lines.next().await {
        let line = match result {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "error decoding line from stream");
                continue;
            }
        };
        let response = dispatch_line(&line, &manager).await;
        for reply_line in response.render() {
            if let Err(e) = lines.send(reply_line).await {
                tracing::warn!(error = %e, "error sending response");
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn run_udp(socket: UdpSocket, manager: Arc<Manager>) -> Result<()> {
    let mut buf = vec![0u8; MAX_LINE_BYTES * 4];
    loop {
        let (n, _addr) = socket.recv_from(&mut buf).await?;
        let datagram = String::from_utf8_lossy(&buf[..n]).into_owned();
        for line in datagram.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            // Fire and forget: UDP clients never receive a reply.
            let _ = dispatch_line(line, &manager).await;
        }
    }
}

/// Binds a UDP socket and best-effort widens its receive buffer, trying
/// progressively smaller sizes until the kernel accepts one.
pub fn bind_udp_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    for size in UDP_RECV_BUFFER_CANDIDATES {
        if socket.set_recv_buffer_size(size).is_ok() {
            break;
        }
    }

    UdpSocket::from_std(socket.into())
}

async fn dispatch_line(line: &str, manager: &Manager) -> Response {
    let request = match Request::parse(line) {
        Ok(req) => req,
        Err(e) => return Response::from_error(&e),
    };
    match dispatch(request, manager).await {
        Ok(response) => response,
        Err(e) => {
            if !e.is_client_fault() {
                tracing::error!(error = %e, "internal error handling request");
            }
            Response::from_error(&e)
        }
    }
}

async fn dispatch(request: Request, manager: &Manager) -> Result<Response> {
    match request {
        Request::Create { name, overrides } => {
            manager.create(&name, overrides).await?;
            Ok(Response::Done)
        }
        Request::Drop(name) => {
            manager.drop_filter(&name).await?;
            Ok(Response::Done)
        }
        Request::Close(name) => {
            manager.close_filter(&name).await?;
            Ok(Response::Done)
        }
        Request::Check { name, key } => {
            let hit = manager.check_key(&name, key).await?;
            Ok(if hit { Response::Yes } else { Response::No })
        }
        Request::Multi { name, keys } => {
            let hits = manager.check_keys(&name, keys).await?;
            Ok(Response::BoolList(hits))
        }
        Request::Set { name, key } => {
            let added = manager.set_key(&name, key).await?;
            Ok(if added { Response::Yes } else { Response::No })
        }
        Request::Bulk { name, keys } => {
            let added = manager.set_keys(&name, keys).await?;
            Ok(Response::BoolList(added))
        }
        Request::Info(name) => {
            let row = manager.info(&name).await?;
            // Counters live behind the registry; info() only hands back a
            // snapshot, so fetch the live entry once more for counters.
            let counters = manager.info_counters(&name).await?;
            Ok(Response::Info(row, counters))
        }
        Request::List => Ok(Response::List(manager.list().await)),
        Request::Flush(Some(name)) => {
            manager.flush_filter(&name).await?;
            Ok(Response::Done)
        }
        Request::Flush(None) => {
            manager.flush_all().await?;
            Ok(Response::Done)
        }
        Request::Conf(Some(name)) => {
            let fields = manager.filter_conf(&name).await?;
            Ok(Response::Conf(fields))
        }
        Request::Conf(None) => Ok(Response::Conf(manager.server_conf())),
    }
}
