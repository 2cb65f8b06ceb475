pub mod audit;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod model;
pub mod policy;
pub mod registry;
pub mod schedule;
pub mod state;
pub mod storage;

pub use config::CustodyConfig;
pub use error::{CustodyError, Result};
pub use model::{Caller, Grant, KeyId, KeyRecord, Principal, Role, Tier};
pub use registry::{Custody, CustodyBuilder, NewMultisigWallet, NewWallet};
