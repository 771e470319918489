//! Media servers: one TCP listener per (ip, port), each with its own accept
//! thread feeding the shared worker pool.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use super::pool::WorkerPool;
use super::ServeError;
use crate::config::endpoint_url;

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// An accepted client connection.
pub struct Connection {
    /// Socket to the client; dropping it closes the connection.
    pub stream: TcpStream,
    /// Remote address, if the OS could report it.
    pub peer: Option<SocketAddr>,
}

/// Unit of work for the pool: a connection and the server that accepted it.
pub struct WorkItem {
    /// Server that accepted the connection; checked before serving.
    pub server: Arc<MediaServer>,
    pub connection: Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Stopped,
}

type ServerMap = Mutex<HashMap<String, Arc<MediaServer>>>;

pub struct MediaServer {
    ip: String,
    port: u16,
    url: String,
    state: Mutex<ServerState>,
    alive: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    pool: WorkerPool<WorkItem>,
    table: Weak<ServerMap>,
}

impl MediaServer {
    fn new(ip: &str, port: u16, pool: WorkerPool<WorkItem>, table: Weak<ServerMap>) -> Arc<Self> {
        Arc::new(Self {
            ip: ip.to_string(),
            port,
            url: endpoint_url(ip, port),
            state: Mutex::new(ServerState::Created),
            alive: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            pool,
            table,
        })
    }

    /// A server that is not registered in any table.
    pub fn standalone(ip: &str, port: u16, pool: WorkerPool<WorkItem>) -> Arc<Self> {
        Self::new(ip, port, pool, Weak::new())
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bound(&self) -> MutexGuard<'_, Option<SocketAddr>> {
        self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind and start the accept thread. Only valid once, from `Created`.
    pub fn listen(self: &Arc<Self>) -> Result<SocketAddr, ServeError> {
        let mut state = self.state();
        if *state != ServerState::Created {
            return Err(ServeError::IllegalState(format!(
                "server {} is {:?}, cannot listen",
                self.url, *state
            )));
        }

        let listener = TcpListener::bind((self.ip.as_str(), self.port)).map_err(|e| {
            ServeError::Internal(format!("failed to bind {}:{}: {}", self.ip, self.port, e))
        })?;
        let addr = listener.local_addr()?;
        *self.bound() = Some(addr);
        self.alive.store(true, Ordering::Release);

        let server = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("media-accept-{}", addr.port()))
            .spawn(move || server.accept_loop(listener));
        if let Err(e) = spawned {
            self.alive.store(false, Ordering::Release);
            *state = ServerState::Stopped;
            return Err(ServeError::Internal(format!("failed to start accept thread: {}", e)));
        }

        *state = ServerState::Listening;
        drop(state);
        self.pool.ensure_worker();
        log::info!("Media server listening on {} ({})", addr, self.url);
        Ok(addr)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for incoming in listener.incoming() {
            if !self.is_alive() {
                break;
            }
            match incoming {
                Ok(stream) => {
                    let peer = stream.peer_addr().ok();
                    let item = WorkItem {
                        server: Arc::clone(&self),
                        connection: Connection { stream, peer },
                    };
                    if let Err(e) = self.pool.submit(item) {
                        log::warn!("Dropping connection on {}: {}", self.url, e);
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    log::debug!("Transient accept error on {}: {}", self.url, e);
                }
                Err(e) => {
                    log::error!("Listener on {} failed: {}", self.url, e);
                    self.alive.store(false, Ordering::Release);
                    *self.state() = ServerState::Stopped;
                    self.deregister();
                    break;
                }
            }
        }
        log::debug!("Accept loop for {} exited", self.url);
    }

    /// Stop accepting. Safe to call any number of times, from any state.
    pub fn stop(&self) {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        *self.state() = ServerState::Stopped;
        self.deregister();

        if !was_alive {
            return;
        }
        // accept() is blocking; a throwaway connection lets the loop observe the flag
        if let Some(addr) = *self.bound() {
            let wake = wake_address(addr);
            if let Err(e) = TcpStream::connect_timeout(&wake, WAKE_TIMEOUT) {
                log::debug!("Wake-up connect to {} failed: {}", wake, e);
            }
        }
        log::info!("Media server {} stopped", self.url);
    }

    fn deregister(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut servers = table.lock().unwrap_or_else(|e| e.into_inner());
        let is_self = servers
            .get(&self.url)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self));
        if is_self {
            servers.remove(&self.url);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn current_state(&self) -> ServerState {
        *self.state()
    }

    /// Registry key: the endpoint as configured (`http://{ip}:{port}/`).
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound()
    }

    /// Base URL clients should use: the configured host with the bound port.
    pub fn public_url(&self) -> String {
        let port = self.local_addr().map_or(self.port, |a| a.port());
        endpoint_url(&self.ip, port)
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn wake_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Active servers keyed by endpoint URL.
#[derive(Clone, Default)]
pub struct ServerTable {
    servers: Arc<ServerMap>,
}

impl ServerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MediaServer>>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the live server for (ip, port), starting one if needed.
    pub fn get_or_start(
        &self,
        ip: &str,
        port: u16,
        pool: &WorkerPool<WorkItem>,
    ) -> Result<Arc<MediaServer>, ServeError> {
        let url = endpoint_url(ip, port);
        let mut servers = self.lock();
        if let Some(server) = servers.get(&url) {
            if server.is_alive() {
                return Ok(Arc::clone(server));
            }
        }

        let server = MediaServer::new(ip, port, pool.clone(), Arc::downgrade(&self.servers));
        server.listen()?;
        servers.insert(url, Arc::clone(&server));
        Ok(server)
    }

    pub fn get(&self, url: &str) -> Option<Arc<MediaServer>> {
        self.lock().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop and forget every server.
    pub fn stop_all(&self) {
        // drain first: stop() re-locks the table to deregister
        let drained: Vec<Arc<MediaServer>> = self.lock().drain().map(|(_, s)| s).collect();
        for server in drained {
            server.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn idle_pool() -> WorkerPool<WorkItem> {
        WorkerPool::new(2, |_item: WorkItem| {})
    }

    #[test]
    fn test_second_listen_is_illegal() {
        let pool = idle_pool();
        let server = MediaServer::standalone("127.0.0.1", 0, pool.clone());
        server.listen().unwrap();
        assert_eq!(server.current_state(), ServerState::Listening);
        assert!(matches!(server.listen(), Err(ServeError::IllegalState(_))));
        server.stop();
        pool.shutdown();
    }

    #[test]
    fn test_listen_after_stop_is_illegal() {
        let pool = idle_pool();
        let server = MediaServer::standalone("127.0.0.1", 0, pool.clone());
        server.stop();
        assert_eq!(server.current_state(), ServerState::Stopped);
        assert!(matches!(server.listen(), Err(ServeError::IllegalState(_))));
        pool.shutdown();
    }

    #[test]
    fn test_stop_twice_is_safe() {
        let pool = idle_pool();
        let server = MediaServer::standalone("127.0.0.1", 0, pool.clone());
        server.listen().unwrap();
        server.stop();
        server.stop();
        assert!(!server.is_alive());
        assert_eq!(server.current_state(), ServerState::Stopped);
        pool.shutdown();
    }

    #[test]
    fn test_stop_closes_listener() {
        let pool = idle_pool();
        let server = MediaServer::standalone("127.0.0.1", 0, pool.clone());
        let addr = server.listen().unwrap();
        server.stop();

        // the accept thread drops the listener once it has been woken
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Err(_) => break,
                Ok(mut s) => {
                    let _ = s.write_all(b"x");
                    assert!(std::time::Instant::now() < deadline, "listener still open");
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
        pool.shutdown();
    }

    #[test]
    fn test_public_url_uses_bound_port() {
        let pool = idle_pool();
        let server = MediaServer::standalone("127.0.0.1", 0, pool.clone());
        assert_eq!(server.public_url(), "http://127.0.0.1:0/");
        let addr = server.listen().unwrap();
        assert_eq!(server.url(), "http://127.0.0.1:0/");
        assert_eq!(server.public_url(), format!("http://127.0.0.1:{}/", addr.port()));
        server.stop();
        pool.shutdown();
    }

    #[test]
    fn test_table_reuses_live_server() {
        let pool = idle_pool();
        let table = ServerTable::new();
        let a = table.get_or_start("127.0.0.1", 0, &pool).unwrap();
        let b = table.get_or_start("127.0.0.1", 0, &pool).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        table.stop_all();
        pool.shutdown();
    }

    #[test]
    fn test_stop_deregisters_from_table() {
        let pool = idle_pool();
        let table = ServerTable::new();
        let server = table.get_or_start("127.0.0.1", 0, &pool).unwrap();
        server.stop();
        assert!(table.is_empty());
        assert!(table.get(server.url()).is_none());
        pool.shutdown();
    }

    #[test]
    fn test_stop_all_stops_everything() {
        let pool = idle_pool();
        let table = ServerTable::new();
        let server = table.get_or_start("127.0.0.1", 0, &pool).unwrap();
        table.stop_all();
        assert!(table.is_empty());
        assert!(!server.is_alive());
        pool.shutdown();
    }

    #[test]
    fn test_listen_starts_a_worker() {
        let pool = idle_pool();
        let server = MediaServer::standalone("127.0.0.1", 0, pool.clone());
        server.listen().unwrap();
        assert!(pool.alive() >= 1);
        server.stop();
        pool.shutdown();
    }

    #[test]
    fn test_wake_address_maps_unspecified_to_loopback() {
        let addr: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(wake_address(addr), "127.0.0.1:4000".parse::<SocketAddr>().unwrap());
        let addr: SocketAddr = "[::]:4000".parse().unwrap();
        assert_eq!(wake_address(addr), "[::1]:4000".parse::<SocketAddr>().unwrap());
        let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        assert_eq!(wake_address(addr), addr);
    }
}
