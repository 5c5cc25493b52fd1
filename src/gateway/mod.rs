//! Gateway runtime: wiring and lifecycle.
//!
//! [`Server`] owns the shared components (cache, hub, id allocator,
//! config controller) and runs the long-lived tasks: the TCP acceptor,
//! the config-file watcher, and the subscriber reaper. Everything stops
//! cooperatively through one `watch` shutdown signal.

pub mod config;
pub mod hub;
pub mod poller;
pub mod server;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::core::error::Result;
use crate::core::ident::IdAllocator;
use crate::store::DataCache;

pub use config::{ConfigController, DEFAULT_CONFIG_PATH};
pub use hub::SubscriptionHub;
pub use poller::Poller;
pub use server::TcpServer;

/// Default TCP API port.
pub const DEFAULT_PORT: u16 = 8080;

/// How often the config file is checked for changes.
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// How often dead subscribers are reaped.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Top-level server: owns the component graph and its lifecycle.
pub struct Server {
    cache: Arc<DataCache>,
    hub: Arc<SubscriptionHub>,
    controller: Arc<ConfigController>,
    port: u16,
}

impl Server {
    /// Wire up a server listening on `port`.
    pub fn new(port: u16) -> Self {
        let cache = Arc::new(DataCache::new());
        let hub = Arc::new(SubscriptionHub::new(Arc::clone(&cache)));
        let ids = Arc::new(IdAllocator::new());
        let controller = Arc::new(ConfigController::new(
            ids,
            Arc::clone(&cache),
            Arc::clone(&hub),
        ));

        Self {
            cache,
            hub,
            controller,
            port,
        }
    }

    /// The shared data cache.
    pub fn cache(&self) -> &Arc<DataCache> {
        &self.cache
    }

    /// The subscription hub.
    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.hub
    }

    /// The configuration controller.
    pub fn controller(&self) -> &Arc<ConfigController> {
        &self.controller
    }

    /// Load and bind the configuration at `path`.
    ///
    /// A failure here is fatal at boot: the process should exit non-zero.
    pub async fn load_config(&self, path: &Path) -> Result<()> {
        self.controller.load(path).await
    }

    /// Bind the TCP listener.
    ///
    /// Separate from [`Server::serve`] so callers (and tests) can learn
    /// the bound address first; a bind failure is fatal.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        Ok(listener)
    }

    /// Run until `shutdown` flips: acceptor + config watcher + reaper.
    ///
    /// On the way out the poller generation is stopped and adapter
    /// sessions are closed.
    pub async fn serve(&self, listener: TcpListener, shutdown: watch::Receiver<bool>) {
        let watcher = {
            let controller = Arc::clone(&self.controller);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(WATCH_INTERVAL) => {
                            match controller.check_reload().await {
                                Ok(true) => info!("configuration reloaded"),
                                Ok(false) => {}
                                Err(e) => warn!(error = %e, "config reload aborted"),
                            }
                        }
                    }
                }
            })
        };

        let reaper = {
            let hub = Arc::clone(&self.hub);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(REAP_INTERVAL) => hub.reap(),
                    }
                }
            })
        };

        let tcp = TcpServer::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.hub),
            Arc::clone(&self.controller),
        );
        tcp.run(listener, shutdown).await;

        if let Err(e) = tokio::try_join!(watcher, reaper) {
            error!(error = %e, "background task panicked");
        }

        self.controller.stop().await;
        self.hub.shutdown();
        info!("server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn sim_config(vars: &[(i64, &str)]) -> JsonValue {
        let mut variables = serde_json::Map::new();
        for (id, name) in vars {
            variables.insert(
                name.to_string(),
                serde_json::json!({
                    "id": id, "name": name, "address": 100, "type": "float32"
                }),
            );
        }
        serde_json::json!({
            "modbus_tcp": {
                "connection_parameters": {
                    "primary": {"host": "127.0.0.1", "port": 1502},
                    "secondary": [
                        {"host": "127.0.0.2", "port": 1502},
                        {"host": "127.0.0.3", "port": 1502}
                    ],
                    "mode": "simulation"
                },
                "polling_interval_ms": 20,
                "variables": variables
            }
        })
    }

    async fn request(addr: std::net::SocketAddr, line: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_server_end_to_end_with_simulation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            serde_json::to_string(&sim_config(&[(1001, "T")]))
                .unwrap()
                .as_bytes(),
        )
        .unwrap();
        file.flush().unwrap();

        let server = Server::new(0);
        server.load_config(file.path()).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);

        let server = Arc::new(server);
        let serve_task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener, rx).await })
        };

        // The simulated adapter needs a few ticks to connect and publish.
        let mut populated = false;
        for _ in 0..100 {
            if server.cache().current_of(1001).is_some() {
                populated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(populated, "simulated poller never produced a sample");

        let reply = request(addr, "GET_ALL\n").await;
        let snapshot: JsonValue = serde_json::from_str(reply.trim_end()).unwrap();
        assert_eq!(snapshot["1001"]["n"], "T");

        tx.send(true).unwrap();
        serve_task.await.unwrap();
    }
}
