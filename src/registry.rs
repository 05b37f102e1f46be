//! Connection identity and the shared, reference-counted connection
//! registry.
//!
//! The registry is the single source of truth for which connections
//! exist. It owns every transport handle it holds; consumers only hold a
//! lease, represented by their contribution to an entry's reference
//! count. The first consumer for a key opens the connection, later ones
//! share it, and the last one out closes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio_tungstenite::tungstenite::http::Uri;
use tracing::{debug, warn};

use crate::stream::transport::{Connection, SharedStreamError};

/// Credential-mode component of a connection's identity.
///
/// An absent flag is a distinct, stable identity, never merged with an
/// explicit `false`: consumers share a connection only when their flags
/// match exactly.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CredentialMode {
    Unset,
    Disabled,
    Enabled,
}

impl CredentialMode {
    fn as_str(self) -> &'static str {
        match self {
            CredentialMode::Unset => "unset",
            CredentialMode::Disabled => "disabled",
            CredentialMode::Enabled => "enabled",
        }
    }
}

impl From<Option<bool>> for CredentialMode {
    fn from(flag: Option<bool>) -> Self {
        match flag {
            None => CredentialMode::Unset,
            Some(false) => CredentialMode::Disabled,
            Some(true) => CredentialMode::Enabled,
        }
    }
}

/// Canonical identity under which transport connections are shared.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionKey {
    address: String,
    credentials: CredentialMode,
}

impl ConnectionKey {
    /// Derives the key for an address and credential flag.
    ///
    /// The address is canonicalized through URI parsing so equivalent
    /// spellings of the same target collide to one key. Derivation has
    /// no side effects and fails only for malformed addresses, before
    /// any connection is opened.
    pub fn derive(address: &str, credentials: Option<bool>) -> Result<Self, SharedStreamError> {
        let uri: Uri = address
            .parse()
            .map_err(|source| SharedStreamError::InvalidAddress {
                address: address.to_string(),
                source,
            })?;
        Ok(Self {
            address: canonical_address(&uri),
            credentials: credentials.into(),
        })
    }

    /// Canonical address component of the key.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Credential-mode component of the key.
    pub fn credentials(&self) -> CredentialMode {
        self.credentials
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [credentials {}]", self.address, self.credentials.as_str())
    }
}

// Scheme and authority are case-insensitive per RFC 3986; an empty path
// and "/" name the same target.
fn canonical_address(uri: &Uri) -> String {
    let mut out = String::new();
    if let Some(scheme) = uri.scheme_str() {
        out.push_str(&scheme.to_ascii_lowercase());
        out.push_str("://");
    }
    if let Some(authority) = uri.authority() {
        out.push_str(&authority.as_str().to_ascii_lowercase());
    }
    let path = uri.path();
    if path.is_empty() {
        out.push('/');
    } else {
        out.push_str(path);
    }
    if let Some(query) = uri.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

struct SharedEntry {
    ref_count: usize,
    conn: Arc<dyn Connection>,
}

/// Registry of live connections, keyed by [`ConnectionKey`].
///
/// A process-wide instance is available through
/// [`ConnectionRegistry::global`]; independent instances can be
/// constructed for scoped sharing or test isolation.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionKey, SharedEntry>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide shared registry.
    pub fn global() -> Arc<ConnectionRegistry> {
        static GLOBAL: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ConnectionRegistry::new())))
    }

    /// Returns the connection for `key`, opening it through `open` if no
    /// consumer holds it yet.
    ///
    /// An existing entry is shared and its reference count incremented;
    /// `open` is only called when no entry exists, so at most one
    /// connection is live per key. If `open` fails the error propagates
    /// and nothing is stored.
    ///
    /// The factory runs while the registry is locked: it must validate
    /// and spawn, not block.
    pub fn acquire<F>(&self, key: &ConnectionKey, open: F) -> Result<Arc<dyn Connection>, SharedStreamError>
    where
        F: FnOnce() -> Result<Arc<dyn Connection>, SharedStreamError>,
    {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(key) {
            entry.ref_count += 1;
            debug!(event = "registry_acquire_shared", key = %key, ref_count = entry.ref_count);
            return Ok(Arc::clone(&entry.conn));
        }

        let conn = open()?;
        debug!(event = "registry_acquire_opened", key = %key);
        entries.insert(
            key.clone(),
            SharedEntry {
                ref_count: 1,
                conn: Arc::clone(&conn),
            },
        );
        Ok(conn)
    }

    /// Releases one lease on `key`.
    ///
    /// When the last lease is released the connection is closed exactly
    /// once and the entry removed. Releasing a key with no entry is a
    /// no-op: a caller-contract violation, logged rather than escalated.
    pub fn release(&self, key: &ConnectionKey) {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(key) else {
            warn!(event = "registry_release_absent", key = %key);
            return;
        };

        // Entries are removed as soon as the count reaches zero, so a
        // present entry always has at least one lease.
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            debug!(event = "registry_release", key = %key, ref_count = entry.ref_count);
            return;
        }

        if let Some(entry) = entries.remove(key) {
            debug!(event = "registry_entry_closed", key = %key);
            entry.conn.close();
        }
    }

    /// Number of active leases on `key`, or `None` when no entry exists.
    pub fn ref_count(&self, key: &ConnectionKey) -> Option<usize> {
        self.lock_entries().get(key).map(|entry| entry.ref_count)
    }

    /// True when no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Closes every registered connection and clears the registry, for
    /// graceful shutdown. Outstanding leases become dangling; their
    /// releases will log and no-op.
    pub fn close_all(&self) {
        let mut entries = self.lock_entries();
        for (key, entry) in entries.drain() {
            debug!(event = "registry_entry_closed", key = %key, ref_count = entry.ref_count);
            entry.conn.close();
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionKey, SharedEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
