//! Host and client resolvers handed to the proxy.
//!
//! [`NetworkHostResolver`] remembers which names an address was reached
//! under, so exchanges addressed by IP can be labelled with a host.
//! [`ProcNetClientResolver`] maps a client's source port to the uid that
//! owns the socket by reading the kernel's TCP tables.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// Maps addresses to the host names they were reached under.
pub trait HostResolver: Send + Sync {
    /// Host name last seen for `ip`.
    fn resolve(&self, ip: IpAddr) -> Option<String>;

    /// Records that `host` resolves to `ip`.
    fn remember(&self, ip: IpAddr, host: &str);

    /// Looks `host` up and remembers every address it resolves to.
    fn learn(&self, host: &str);

    /// Returns true if `host` was already looked up.
    fn knows(&self, _host: &str) -> bool {
        false
    }

    /// Releases cached state.
    fn clean_up(&self);
}

/// Identity of the local process behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    /// Owning uid.
    pub uid: u32,
}

/// Maps a connection's peer address to the local process behind it.
pub trait ClientResolver: Send + Sync {
    /// Owner of the connection whose client side is `peer`.
    fn resolve(&self, peer: SocketAddr) -> Option<ClientInfo>;

    /// Releases cached state.
    fn clean_up(&self) {}
}

/// Caching host resolver backed by the system resolver.
#[derive(Debug, Default)]
pub struct NetworkHostResolver {
    names: RwLock<HashMap<IpAddr, String>>,
    learned: RwLock<HashSet<String>>,
}

impl NetworkHostResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached addresses.
    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}

impl HostResolver for NetworkHostResolver {
    fn resolve(&self, ip: IpAddr) -> Option<String> {
        self.names.read().get(&ip).cloned()
    }

    fn remember(&self, ip: IpAddr, host: &str) {
        self.names.write().insert(ip, host.to_string());
    }

    fn learn(&self, host: &str) {
        if host.parse::<IpAddr>().is_ok() {
            return;
        }

        // Failed lookups are not retried until the next clean up
        if !self.learned.write().insert(host.to_string()) {
            return;
        }

        match (host, 0u16).to_socket_addrs() {
            Ok(addrs) => {
                let mut names = self.names.write();
                for addr in addrs {
                    names.insert(addr.ip(), host.to_string());
                }
            }
            Err(e) => tracing::debug!("Lookup of {} failed: {}", host, e),
        }
    }

    fn knows(&self, host: &str) -> bool {
        self.learned.read().contains(host)
    }

    fn clean_up(&self) {
        let mut names = self.names.write();
        tracing::debug!("Dropping {} cached host names", names.len());
        names.clear();
        self.learned.write().clear();
    }
}

/// Kernel TCP tables.
const PROC_NET_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];

/// Client resolver reading `/proc/net/tcp` and `/proc/net/tcp6`.
#[derive(Debug, Clone)]
pub struct ProcNetClientResolver {
    tables: Vec<PathBuf>,
}

impl Default for ProcNetClientResolver {
    fn default() -> Self {
        Self {
            tables: PROC_NET_TABLES.iter().map(PathBuf::from).collect(),
        }
    }
}

impl ProcNetClientResolver {
    /// Creates a resolver over the standard tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver over specific table files.
    pub fn with_tables<I, P>(tables: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            tables: tables.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
        }
    }
}

impl ClientResolver for ProcNetClientResolver {
    fn resolve(&self, peer: SocketAddr) -> Option<ClientInfo> {
        self.tables.iter().find_map(|table| {
            let contents = std::fs::read_to_string(table).ok()?;
            find_owner(&contents, peer.port()).map(|uid| ClientInfo { uid })
        })
    }
}

/// Finds the uid owning the socket whose local port is `port`.
///
/// Rows look like
/// `0: 0100007F:D431 0100007F:2328 01 00000000:00000000 00:00000000 00000000 10042 ...`
/// with the local address second and the uid eighth.
pub fn find_owner(table: &str, port: u16) -> Option<u32> {
    table.lines().skip(1).find_map(|row| {
        let fields: Vec<&str> = row.split_whitespace().collect();
        if fields.len() < 8 {
            return None;
        }

        let (_, local_port) = fields[1].rsplit_once(':')?;
        if u16::from_str_radix(local_port, 16).ok()? != port {
            return None;
        }

        fields[7].parse().ok()
    })
}
