// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-for-byte proxies between host-local sockets and TCP.
//!
//! The hypervisor refuses to migrate over a local socket, and the sockets
//! it does expose cannot be dialed from the other host. Each side of a
//! migration therefore runs a set of tunnels:
//!
//! - On the source, [`TunnelRole::Source`] tunnels listen on loopback TCP
//!   ports and forward every connection to a local socket that leads to the
//!   destination.
//! - On the target, [`TunnelRole::Target`] tunnels listen on those local
//!   sockets and forward every connection to the local TCP endpoint the
//!   destination hypervisor listens on.
//!
//! Tunnels belong to exactly one migration attempt. A [`TunnelSet`] is
//! opened all-or-nothing and closed together when the attempt ends.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use slog::{debug, error, info, o, warn, Logger};
use thiserror::Error;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

/// Port the destination's control connection is tunnelled through.
pub const CONTROL_PORT: u16 = 22222;

/// Port for the hypervisor's direct memory-transfer connection.
pub const DIRECT_MIGRATION_PORT: u16 = 49152;

/// Additional port used for disk transfer during block migration.
pub const BLOCK_MIGRATION_PORT: u16 = 49153;

const PROXY_DIR: &str = "migrationproxy";

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to listen on {addr}: {source}")]
    TcpBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on socket {path:?}: {source}")]
    SocketBind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelRole {
    /// Accept on TCP, forward to the local socket.
    Source,
    /// Accept on the local socket, forward to TCP.
    Target,
}

/// Describes one tunnel: which local socket it bridges to which TCP
/// address, and in which direction connections flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local_socket: PathBuf,
    pub tcp_addr: SocketAddr,
    pub role: TunnelRole,
}

/// Where tunnels listen and which ports a migration uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Directory shared with the hypervisor; local sockets live under
    /// `<share_dir>/migrationproxy`.
    pub share_dir: PathBuf,
    pub bind_addr: IpAddr,
    pub control_port: u16,
    pub direct_migration_port: u16,
    pub block_migration_port: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            share_dir: PathBuf::from("/var/run/kubevirt"),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: CONTROL_PORT,
            direct_migration_port: DIRECT_MIGRATION_PORT,
            block_migration_port: BLOCK_MIGRATION_PORT,
        }
    }
}

/// Identifies the local socket for one of a workload's migration ports.
/// Namespacing by workload keeps concurrent migrations of different
/// workloads on the same host from colliding.
pub fn proxy_key(uid: &Uuid, port: u16) -> String {
    format!("{uid}-{port}")
}

impl TunnelConfig {
    /// Ports that carry migration data, besides the control port.
    pub fn migration_ports(&self, block_migration: bool) -> Vec<u16> {
        let mut ports = vec![self.direct_migration_port];
        if block_migration {
            ports.push(self.block_migration_port);
        }
        ports
    }

    pub fn socket_path(&self, key: &str) -> PathBuf {
        self.share_dir.join(PROXY_DIR).join(format!("{key}-source.sock"))
    }

    fn tcp_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_addr, port)
    }

    /// Tunnels the migration source needs: one per migration port, then
    /// the control connection.
    pub fn source_specs(
        &self,
        uid: &Uuid,
        block_migration: bool,
    ) -> Vec<TunnelSpec> {
        let mut specs: Vec<TunnelSpec> = self
            .migration_ports(block_migration)
            .into_iter()
            .map(|port| TunnelSpec {
                local_socket: self.socket_path(&proxy_key(uid, port)),
                tcp_addr: self.tcp_addr(port),
                role: TunnelRole::Source,
            })
            .collect();
        specs.push(TunnelSpec {
            local_socket: self.socket_path(&uid.to_string()),
            tcp_addr: self.tcp_addr(self.control_port),
            role: TunnelRole::Source,
        });
        specs
    }

    /// Tunnels the migration target needs: one per migration port.
    pub fn target_specs(
        &self,
        uid: &Uuid,
        block_migration: bool,
    ) -> Vec<TunnelSpec> {
        self.migration_ports(block_migration)
            .into_iter()
            .map(|port| TunnelSpec {
                local_socket: self.socket_path(&proxy_key(uid, port)),
                tcp_addr: self.tcp_addr(port),
                role: TunnelRole::Target,
            })
            .collect()
    }
}

/// A running tunnel. Dropping it stops the tunnel, but [`Tunnel::close`]
/// should be preferred since it waits for the listener to be released.
#[derive(Debug)]
pub struct Tunnel {
    spec: TunnelSpec,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
    log: Logger,
}

impl Tunnel {
    pub async fn open(
        spec: TunnelSpec,
        log: &Logger,
    ) -> Result<Self, TunnelError> {
        let log = log.new(o!(
            "tunnel_role" => format!("{:?}", spec.role),
            "tcp_addr" => spec.tcp_addr.to_string(),
        ));

        let (task, local_addr) = match spec.role {
            TunnelRole::Source => {
                let listener =
                    TcpListener::bind(spec.tcp_addr).await.map_err(|e| {
                        TunnelError::TcpBind { addr: spec.tcp_addr, source: e }
                    })?;
                let local_addr = listener.local_addr().ok();
                let task = tokio::spawn(serve_tcp(
                    listener,
                    spec.local_socket.clone(),
                    log.clone(),
                ));
                (task, local_addr)
            }
            TunnelRole::Target => {
                let listener =
                    bind_local_socket(&spec.local_socket).map_err(|e| {
                        TunnelError::SocketBind {
                            path: spec.local_socket.clone(),
                            source: e,
                        }
                    })?;
                let task = tokio::spawn(serve_local_socket(
                    listener,
                    spec.tcp_addr,
                    log.clone(),
                ));
                (task, None)
            }
        };

        info!(log, "migration tunnel listening";
            "socket" => %spec.local_socket.display());
        Ok(Self { spec, local_addr, task: Some(task), log })
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// The address a source-role tunnel actually bound, which differs from
    /// the configured one when port 0 was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting connections, tears down any proxied connections, and
    /// waits until the listener is released.
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.remove_socket();
        debug!(self.log, "migration tunnel closed");
    }

    fn remove_socket(&self) {
        if self.spec.role != TunnelRole::Target {
            return;
        }
        match std::fs::remove_file(&self.spec.local_socket) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(self.log, "failed to remove tunnel socket"; "error" => %e)
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.remove_socket();
        }
    }
}

/// The tunnels belonging to a single migration attempt.
#[derive(Debug, Default)]
pub struct TunnelSet {
    tunnels: Vec<Tunnel>,
}

impl TunnelSet {
    /// Opens every tunnel in `specs`. If any of them fails, the tunnels
    /// already opened are closed before the error is returned.
    pub async fn open_all(
        specs: impl IntoIterator<Item = TunnelSpec>,
        log: &Logger,
    ) -> Result<Self, TunnelError> {
        let mut set = Self::default();
        for spec in specs {
            match Tunnel::open(spec, log).await {
                Ok(tunnel) => set.tunnels.push(tunnel),
                Err(e) => {
                    error!(log, "failed to open migration tunnel";
                        "error" => %e);
                    set.close().await;
                    return Err(e);
                }
            }
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tunnel> {
        self.tunnels.iter()
    }

    /// Closes every tunnel in the set, most recently opened first.
    pub async fn close(&mut self) {
        let tunnels = std::mem::take(&mut self.tunnels);
        for tunnel in tunnels.into_iter().rev() {
            tunnel.close().await;
        }
    }
}

fn bind_local_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            // A previous attempt left its socket behind.
            std::fs::remove_file(path)?;
            UnixListener::bind(path)
        }
        Err(e) => Err(e),
    }
}

async fn serve_tcp(listener: TcpListener, socket: PathBuf, log: Logger) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (inbound, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(log, "tunnel accept failed"; "error" => %e);
                        break;
                    }
                };
                let socket = socket.clone();
                let log = log.new(o!("peer" => peer.to_string()));
                conns.spawn(async move {
                    match UnixStream::connect(&socket).await {
                        Ok(outbound) => proxy(inbound, outbound, &log).await,
                        Err(e) => error!(log, "failed to dial tunnel socket";
                            "socket" => %socket.display(),
                            "error" => %e),
                    }
                });
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
}

async fn serve_local_socket(
    listener: UnixListener,
    addr: SocketAddr,
    log: Logger,
) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (inbound, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(log, "tunnel accept failed"; "error" => %e);
                        break;
                    }
                };
                let log = log.clone();
                conns.spawn(async move {
                    match TcpStream::connect(addr).await {
                        Ok(outbound) => proxy(inbound, outbound, &log).await,
                        Err(e) => error!(log, "failed to dial tunnel address";
                            "error" => %e),
                    }
                });
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
}

async fn proxy<A, B>(mut inbound: A, mut outbound: B, log: &Logger)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((to_out, to_in)) => {
            debug!(log, "tunnel connection closed";
                "bytes_out" => to_out, "bytes_in" => to_in)
        }
        Err(e) => debug!(log, "tunnel connection failed"; "error" => %e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Reserves a port number by binding and immediately releasing it.
    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind(loopback(0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn echo<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[test]
    fn source_specs_cover_migration_and_control_ports() {
        let config = TunnelConfig {
            share_dir: PathBuf::from("/run/share"),
            ..Default::default()
        };
        let uid = Uuid::new_v4();

        let live = config.source_specs(&uid, false);
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].tcp_addr, loopback(DIRECT_MIGRATION_PORT));
        let proxy_dir = PathBuf::from("/run/share/migrationproxy");
        assert_eq!(
            live[0].local_socket,
            proxy_dir.join(format!("{uid}-{DIRECT_MIGRATION_PORT}-source.sock"))
        );
        assert_eq!(live[1].tcp_addr, loopback(CONTROL_PORT));
        assert_eq!(
            live[1].local_socket,
            proxy_dir.join(format!("{uid}-source.sock"))
        );
        assert!(live.iter().all(|s| s.role == TunnelRole::Source));

        let block = config.source_specs(&uid, true);
        assert_eq!(block.len(), 3);
        assert_eq!(block[1].tcp_addr, loopback(BLOCK_MIGRATION_PORT));
    }

    #[test]
    fn target_specs_skip_control_port() {
        let config = TunnelConfig::default();
        let uid = Uuid::new_v4();
        let specs = config.target_specs(&uid, true);
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.role == TunnelRole::Target));
        assert!(specs.iter().all(|s| s.tcp_addr.port() != CONTROL_PORT));
    }

    #[test]
    fn proxy_keys_are_namespaced_by_workload() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(proxy_key(&a, 49152), proxy_key(&b, 49152));
        assert_eq!(proxy_key(&a, 49152), format!("{a}-49152"));
    }

    #[tokio::test]
    async fn source_tunnel_proxies_tcp_to_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("dst.sock");
        let server = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            while let Ok((conn, _)) = server.accept().await {
                tokio::spawn(echo(conn));
            }
        });

        let tunnel = Tunnel::open(
            TunnelSpec {
                local_socket: socket,
                tcp_addr: loopback(0),
                role: TunnelRole::Source,
            },
            &test_logger(),
        )
        .await
        .unwrap();

        let mut client =
            TcpStream::connect(tunnel.local_addr().unwrap()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        tunnel.close().await;
    }

    #[tokio::test]
    async fn target_tunnel_proxies_socket_to_tcp() {
        let server = TcpListener::bind(loopback(0)).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((conn, _)) = server.accept().await {
                tokio::spawn(echo(conn));
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(PROXY_DIR).join("key-source.sock");
        let tunnel = Tunnel::open(
            TunnelSpec {
                local_socket: socket.clone(),
                tcp_addr: addr,
                role: TunnelRole::Target,
            },
            &test_logger(),
        )
        .await
        .unwrap();

        let mut client = UnixStream::connect(&socket).await.unwrap();
        client.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        tunnel.close().await;
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("stale.sock");
        let stale = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        drop(stale);
        assert!(socket.exists());

        let tunnel = Tunnel::open(
            TunnelSpec {
                local_socket: socket.clone(),
                tcp_addr: loopback(1),
                role: TunnelRole::Target,
            },
            &test_logger(),
        )
        .await
        .unwrap();
        assert!(UnixStream::connect(&socket).await.is_ok());
        tunnel.close().await;
    }

    #[tokio::test]
    async fn failed_open_releases_earlier_tunnels() {
        let dir = tempfile::tempdir().unwrap();
        let first_port = free_port();
        let busy = std::net::TcpListener::bind(loopback(0)).unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let spec = |port| TunnelSpec {
            local_socket: dir.path().join("unused.sock"),
            tcp_addr: loopback(port),
            role: TunnelRole::Source,
        };
        let specs = vec![spec(first_port), spec(busy_port), spec(0)];

        let err = TunnelSet::open_all(specs, &test_logger()).await.unwrap_err();
        match err {
            TunnelError::TcpBind { addr, .. } => {
                assert_eq!(addr.port(), busy_port)
            }
            other => panic!("unexpected error {other:?}"),
        }

        // The first tunnel's listener must be gone.
        std::net::TcpListener::bind(loopback(first_port))
            .expect("first tunnel's port should have been released");
    }

    #[tokio::test]
    async fn closing_a_set_releases_all_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let specs = (0..3).map(|i| TunnelSpec {
            local_socket: dir.path().join(format!("{i}.sock")),
            tcp_addr: loopback(0),
            role: TunnelRole::Source,
        });
        let mut set = TunnelSet::open_all(specs, &test_logger()).await.unwrap();
        assert_eq!(set.len(), 3);
        let addrs: Vec<SocketAddr> =
            set.iter().filter_map(Tunnel::local_addr).collect();

        set.close().await;
        assert!(set.is_empty());
        for addr in addrs {
            std::net::TcpListener::bind(addr)
                .expect("closed tunnel's port should be free");
        }
    }
}
