//! Mainline DHT (BEP 5, spec.md §4.7): Kademlia routing table, KRPC codec,
//! token-based `announce_peer` auth, and the iterative `get_peers` lookup.

pub mod bootstrap;
pub mod compact;
pub mod krpc;
pub mod lookup;
pub mod node;
pub mod node_id;
pub mod peer_store;
pub mod routing_table;
pub mod token_store;
pub mod transaction;

pub use bootstrap::{due_refreshes, RefreshTarget, DEFAULT_BOOTSTRAP_NODES};
pub use krpc::{Body, Envelope, KrpcCodecError, KrpcError, Query, Response};
pub use lookup::{Lookup, LookupResult};
pub use node::{DhtError, DhtNodeHandle, DHT_LOG_TARGET};
pub use node_id::{Distance, NodeId};
pub use peer_store::PeerStore;
pub use routing_table::{DhtNode, InsertOutcome, RoutingTable};
pub use token_store::TokenStore;
pub use transaction::{Pending, TransactionManager, TransactionOutcome};
