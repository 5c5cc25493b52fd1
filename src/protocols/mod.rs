//! Protocol adapter contract.
//!
//! Adapters bridge one field protocol to the gateway: they own the
//! transport session, read configured variables, and publish every
//! observation into the cache and the subscription hub. The generic
//! connection machinery (endpoint failover, sticky selection, exponential
//! reconnect throttle, status transitions) lives in [`AdapterCore`] so
//! concrete adapters only supply `try_connect`, `release`, and
//! `read_batch`.

pub mod modbus;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::data::{Value, VarId, VarType};
use crate::core::error::{GatewayError, Result};
use crate::core::quality::Quality;
use crate::gateway::hub::SubscriptionHub;
use crate::store::DataCache;

/// Reconnect throttle exponent cap: the inter-attempt gap never exceeds
/// 2^6 = 64 seconds.
const MAX_BACKOFF_EXP: u32 = 6;

/// One device endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,

    /// Connect/IO timeout for this endpoint.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

impl EndpointConfig {
    /// `host:port` form for transports that take a socket address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Endpoint timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Adapter operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    /// Talk to real devices.
    #[default]
    Real,

    /// Synthetic transport: connects with ~75% probability and emits
    /// pseudo-random values of the requested type.
    Simulation,
}

/// `connection_parameters` section of a protocol's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred endpoint.
    pub primary: EndpointConfig,

    /// Ordered failover endpoints.
    #[serde(default)]
    pub secondary: Vec<EndpointConfig>,

    /// Real transport or simulation.
    #[serde(default)]
    pub mode: AdapterMode,
}

/// A variable bound to an adapter, ready for polling.
///
/// Produced by the config controller after id assignment; the `address`
/// stays an opaque JSON value the concrete adapter interprets.
#[derive(Debug, Clone)]
pub struct VariableSpec {
    pub id: VarId,
    pub name: String,
    pub address: serde_json::Value,
    pub var_type: VarType,
    pub polling_interval_ms: Option<u64>,
}

impl VariableSpec {
    /// Effective polling interval: the variable-level override, falling
    /// back to the protocol default.
    pub fn interval(&self, protocol_default: Duration) -> Duration {
        self.polling_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(protocol_default)
    }
}

/// Per-variable entry returned by `read_batch`: `{n, v, t}` where `t` is
/// the declared type tag.
#[derive(Debug, Clone, Serialize)]
pub struct ReadEntry {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "v")]
    pub value: Value,
    #[serde(rename = "t")]
    pub var_type: VarType,
}

/// Throttle window after `attempts` consecutive failed connect rounds.
pub(crate) fn backoff_window(attempts: u32) -> Duration {
    Duration::from_secs(1_u64 << attempts.min(MAX_BACKOFF_EXP))
}

/// Shared adapter state: endpoint set, reconnect bookkeeping, and the
/// publish sink into cache + hub.
pub struct AdapterCore {
    name: String,
    endpoints: Vec<EndpointConfig>,
    current_endpoint: usize,
    attempts: u32,
    last_attempt: Option<Instant>,
    connected: bool,
    cache: Arc<DataCache>,
    hub: Arc<SubscriptionHub>,
}

impl AdapterCore {
    /// Create a core for the protocol named `name`.
    pub fn new(name: impl Into<String>, cache: Arc<DataCache>, hub: Arc<SubscriptionHub>) -> Self {
        Self {
            name: name.into(),
            endpoints: Vec::new(),
            current_endpoint: 0,
            attempts: 0,
            last_attempt: None,
            connected: false,
            cache,
            hub,
        }
    }

    /// Protocol key this adapter serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the endpoint set and reset the sticky index.
    pub fn configure_endpoints(&mut self, config: &ConnectionConfig) {
        self.endpoints.clear();
        self.endpoints.push(config.primary.clone());
        self.endpoints.extend(config.secondary.iter().cloned());
        self.current_endpoint = 0;
    }

    /// Configured endpoints, primary first.
    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    /// Sticky endpoint index (last successful connection).
    pub fn current_endpoint(&self) -> usize {
        self.current_endpoint
    }

    /// Whether the adapter currently holds a session.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Consecutive failed connect rounds.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Check the exponential reconnect throttle: after a failed round, no
    /// new attempt is made until 2^attempts seconds (capped) have passed.
    fn throttled(&self) -> bool {
        match self.last_attempt {
            Some(at) if self.attempts > 0 => at.elapsed() < backoff_window(self.attempts),
            _ => false,
        }
    }

    fn note_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }

    fn mark_connected(&mut self, endpoint_index: usize) {
        self.current_endpoint = endpoint_index;
        self.attempts = 0;
        if !self.connected {
            self.connected = true;
            info!(protocol = %self.name, "connection status: connected");
        }
    }

    fn mark_disconnected(&mut self) {
        if self.connected {
            self.connected = false;
            info!(protocol = %self.name, "connection status: disconnected");
        }
    }

    fn record_failed_round(&mut self) {
        self.attempts += 1;
        self.mark_disconnected();
    }

    /// Publish one observation: update the cache and fan out to
    /// subscribers. Synchronous and non-blocking, safe to call from the
    /// adapter's read loop.
    pub fn publish(&self, id: VarId, name: &str, value: Value, quality: Quality) {
        self.cache.update(id, name, value.clone(), quality);
        self.hub.publish(id, name, &value);
    }
}

/// Contract every protocol adapter implements.
///
/// `connect` and `disconnect` are provided: they drive the endpoint
/// rotation and backoff in [`AdapterCore`] and call back into the
/// adapter's `try_connect`/`release` for the transport specifics.
#[async_trait]
pub trait ProtocolAdapter: Send {
    /// Shared connection state.
    fn core(&self) -> &AdapterCore;

    /// Shared connection state, mutable.
    fn core_mut(&mut self) -> &mut AdapterCore;

    /// Open a session to a single endpoint. Returns `true` on success.
    async fn try_connect(&mut self, endpoint: &EndpointConfig) -> bool;

    /// Drop the underlying transport session.
    async fn release(&mut self);

    /// Read every variable in the batch, publishing each result (bad
    /// quality with a null value on per-variable failure). A transport
    /// failure disconnects and returns what was collected so far.
    async fn read_batch(&mut self, variables: &[VariableSpec]) -> HashMap<VarId, ReadEntry>;

    /// Whether a session is currently open.
    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    /// Apply a `connection_parameters` section.
    ///
    /// Adapters with mode-dependent transports override this to capture
    /// their extra settings before delegating to the core.
    fn configure(&mut self, config: &ConnectionConfig) {
        self.core_mut().configure_endpoints(config);
    }

    /// Attempt to establish a session.
    ///
    /// Rotates through the endpoint set starting at the sticky index and
    /// returns `true` on the first success. Returns `false` without
    /// touching the transport while the reconnect throttle is active.
    async fn connect(&mut self) -> Result<bool> {
        if self.core().endpoints().is_empty() {
            return Err(GatewayError::config(format!(
                "no connection parameters for {}",
                self.core().name()
            )));
        }

        if self.core().throttled() {
            return Ok(false);
        }
        self.core_mut().note_attempt();

        let endpoints = self.core().endpoints().to_vec();
        let start = self.core().current_endpoint();
        for offset in 0..endpoints.len() {
            let idx = (start + offset) % endpoints.len();
            let endpoint = &endpoints[idx];
            info!(
                protocol = %self.core().name(),
                host = %endpoint.host,
                port = endpoint.port,
                "attempting connection"
            );

            if self.try_connect(endpoint).await {
                self.core_mut().mark_connected(idx);
                return Ok(true);
            }
        }

        self.core_mut().record_failed_round();
        warn!(
            protocol = %self.core().name(),
            attempts = self.core().attempts(),
            "all connection attempts failed"
        );
        Ok(false)
    }

    /// Close the session and mark the adapter disconnected.
    async fn disconnect(&mut self) {
        self.release().await;
        self.core_mut().mark_disconnected();
    }
}

/// Build the adapter for a protocol key.
///
/// Unknown keys (including the planned `iec104` and `snmp`) are a config
/// error; the controller logs and skips them so the rest of the config
/// still binds.
pub fn create_adapter(
    key: &str,
    cache: Arc<DataCache>,
    hub: Arc<SubscriptionHub>,
) -> Result<Box<dyn ProtocolAdapter>> {
    if key.eq_ignore_ascii_case("modbus_tcp") {
        return Ok(Box::new(modbus::ModbusTcpAdapter::new(cache, hub)));
    }

    Err(GatewayError::config(format!(
        "unsupported protocol: {key}"
    )))
}
