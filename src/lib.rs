use std::time::Duration;

pub mod cli;
mod kademlia;
mod key;
mod message;
mod routing;
mod rpc;
mod store;

pub use kademlia::{KademliaBuilder, KademliaNode, StartError};
pub use key::{Distance, Key};
pub use message::{CodecError, Message, MessageType};
pub use routing::{Contact, ContactAndDistance};
pub use store::{MemoryStore, ValueStore};

/// Length of key in bytes
const KEY_LEN: usize = 20;
/// Number of buckets
const N_BUCKETS: usize = KEY_LEN * 8;
/// Entries per bucket
const K_PARAM: usize = 20;
/// Number of parallel requests
const A_PARAM: usize = 3;
/// Max datagram length
const MESSAGE_LEN: usize = 4096;
/// Default request timeout
const TIMEOUT: Duration = Duration::from_millis(5000);
/// Backoff between datagram write retries
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(50);
/// Interval between republications of a stored value
const REPUBLISH_INTERVAL: Duration = Duration::from_secs(60);

/// Default listen port
pub const DEFAULT_PORT: u16 = 1234;
/// Default bootstrap peer
pub const DEFAULT_BOOTSTRAP: &str = "172.26.0.2:1234";
