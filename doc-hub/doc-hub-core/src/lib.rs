pub mod acl;
pub mod auth;
pub mod authz;
pub mod cache;
pub mod config;
pub mod crypt;
pub mod db;
pub mod document;
pub mod error;
pub mod events;
pub mod filter;
pub mod housekeeping;
pub mod store;
pub mod transport;
pub mod watch;

pub use acl::{Ace, Right, Rights};
pub use auth::Subject;
pub use config::StoreConfig;
pub use document::Document;
pub use error::{Result, StoreError, TransportError};
pub use store::DocumentStore;
