//! Shared ECH config-list store
//!
//! Holds the DNS-wire ECH configuration (base64-decoded) fetched from the
//! HTTPS record of the configured domain. Accept tasks and tunnel tasks read
//! it concurrently while a refresh holds the exclusive side.

use parking_lot::RwLock;
use tracing::info;

use crate::dns;
use crate::error::{Error, Result};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Reader/writer-guarded ECH config list
pub struct EchStore {
    domain: String,
    dns_server: String,
    list: RwLock<Vec<u8>>,
}

impl EchStore {
    pub fn new(domain: impl Into<String>, dns_server: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            dns_server: dns_server.into(),
            list: RwLock::new(Vec::new()),
        }
    }

    /// Exclusive set of the raw config list.
    pub fn load(&self, raw: Vec<u8>) {
        *self.list.write() = raw;
    }

    /// Shared read. Fails when no config has been loaded yet.
    pub fn get(&self) -> Result<Vec<u8>> {
        let list = self.list.read();
        if list.is_empty() {
            return Err(Error::EchNotLoaded);
        }
        Ok(list.clone())
    }

    pub fn is_loaded(&self) -> bool {
        !self.list.read().is_empty()
    }

    /// Re-query the HTTPS record and replace the stored config list.
    pub async fn refresh(&self) -> Result<()> {
        let encoded = dns::query_https_record(&self.domain, &self.dns_server)
            .await?
            .ok_or_else(|| {
                Error::Bootstrap(format!("no ECH config in HTTPS record for {}", self.domain))
            })?;

        let raw = BASE64
            .decode(encoded)
            .map_err(|e| Error::Bootstrap(format!("invalid ECH config encoding: {}", e)))?;

        info!("ECH config loaded, {} bytes", raw.len());
        self.load(raw);
        Ok(())
    }
}
