//! Banrelay - distribution and enforcement of network ban records.
//!
//! Intrusion detectors on many hosts produce short self-describing ban
//! records (who to block, on what, until when). This crate carries those
//! records from producers to enforcement points and keeps the external
//! packet filter exactly in sync with the live set.
//!
//! # Features
//!
//! - **Compact wire format**: Tagged binary records covering IPv4/IPv6
//!   addresses, prefixes, ranges, ports and protocols
//! - **Content-addressed dedup**: Renewals of an already-banned target
//!   replace instead of accumulate
//! - **Broker fan-out**: One well-known producer queue, one per-subscriber
//!   queue, full-state snapshot for late joiners
//! - **Leased subscriptions**: Silent subscribers are dropped and their
//!   queues torn down
//! - **Crash-safe checkpoints**: Gzip checkpoint on stop, reloaded through
//!   the normal dedup path on start
//! - **Self-describing rule names**: Enforcement state survives restarts
//!   by decoding expiration and content hash back out of installed rule
//!   names
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use banrelay::{
//!     Broker, BrokerConfig, EnforcementCache, EnforcerConfig,
//!     MemoryFirewall, MemoryTransport, RecordBuilder, ticks_now,
//!     TICKS_PER_SECOND,
//! };
//!
//! // Broker side
//! let transport = Arc::new(MemoryTransport::new());
//! let mut broker = Broker::new(BrokerConfig::default(), transport.clone())?;
//! broker.start()?;
//!
//! // Producer side: ban 203.0.113.5 for ten minutes
//! let mut builder = RecordBuilder::new(ticks_now() + 600 * TICKS_PER_SECOND);
//! builder.add_addr("203.0.113.5".parse()?);
//! let record = builder.build();
//!
//! // Enforcement side
//! let filter = Arc::new(MemoryFirewall::new());
//! let mut cache = EnforcementCache::new(EnforcerConfig::default(), filter);
//! cache.reconcile()?;
//! cache.apply(&record);
//! ```
//!
//! # Record Replacement
//!
//! Records are deduplicated by an MD5 hash of their match fields. For a
//! given target only the latest-expiring record is held; a record that
//! does not extend the expiration is dropped, and at the enforcement
//! point a marginal extension is additionally dampened so the packet
//! filter is not churned for seconds of gain.

mod throttle;

pub mod broker;
pub mod config;
pub mod enforce;
pub mod error;
pub mod firewall;
pub mod frame;
pub mod index;
pub mod record;
pub mod shutdown;
pub mod transport;

// Re-export core types
pub use error::{Error, Result};

// Re-export the wire format
pub use record::{
    decode_name, encode_name, peek_expiration, ticks_now, BanRecord, ContentHash, Field,
    FieldTag, RecordBuilder, TICKS_PER_SECOND,
};
pub use frame::{Frame, FrameKind, Registration};

// Re-export the services and their configuration
pub use broker::Broker;
pub use config::{BrokerConfig, EnforcerConfig};
pub use enforce::EnforcementCache;
pub use index::{DedupIndex, IndexEntry, Insert};

// Re-export the transport and packet-filter seams
pub use firewall::{FirewallError, MemoryFirewall, PacketFilter};
pub use shutdown::Shutdown;
pub use transport::{MemoryTransport, QueueMessage, Transport, TransportError};
