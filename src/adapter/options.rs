// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration for an MQTT adapter, built with the same owned-builder
//! pattern used throughout this codebase's configuration structs.

use bytes::Bytes;
use std::time::Duration;

/// All the settings needed to bind an [`super::AdapterMachine`] to a
/// back-end and attempt a connection.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct AdapterOptions {
    /// Client identifier presented to the broker.
    pub(crate) client_id: String,
    /// FQDN or IP address of the broker.
    pub(crate) hostname: String,
    /// TCP port to connect to.
    #[builder(default = "8883")]
    pub(crate) tcp_port: u16,
    /// Max time between communications.
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) keep_alive: Duration,
    /// Whether TLS negotiation is attempted at all.
    #[builder(default = "true")]
    pub(crate) use_tls: bool,
    /// PEM-encoded trust roots. Empty means fall back to the OS trust
    /// store (when `use_tls` is set).
    #[builder(default = "Bytes::new()")]
    pub(crate) ca_trusted_roots: Bytes,
    /// Optional OpenSSL engine identifier for hardware-backed keys.
    #[builder(default = "None")]
    pub(crate) openssl_engine: Option<String>,
    /// Username for broker-level authentication, if the deployment uses it.
    #[builder(default = "None")]
    pub(crate) username: Option<String>,
    /// Password for broker-level authentication, if the deployment uses it.
    #[builder(default = "None")]
    pub(crate) password: Option<String>,
    /// PEM-encoded client certificate, for mutual-TLS deployments.
    #[builder(default = "None")]
    pub(crate) client_cert: Option<Bytes>,
    /// PEM-encoded client private key paired with `client_cert`.
    #[builder(default = "None")]
    pub(crate) client_key: Option<Bytes>,
}

impl AdapterOptionsBuilder {
    /// Validates that required fields are non-empty.
    ///
    /// # Errors
    /// Returns a `String` describing the problem if `hostname` or
    /// `client_id` is empty.
    fn validate(&self) -> Result<(), String> {
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() {
                return Err("hostname cannot be empty".to_string());
            }
        }
        if let Some(client_id) = &self.client_id {
            if client_id.is_empty() {
                return Err("client_id cannot be empty".to_string());
            }
        }
        Ok(())
    }
}
