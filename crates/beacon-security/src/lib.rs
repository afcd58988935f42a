// Capability keys, channel parsing and contract lookup for the broker edge.
// A channel carries an encrypted key granting permission bits on a channel
// subtree of a contract; everything here is pure data plus the cipher.
pub mod channel;
pub mod cipher;
pub mod contract;
pub mod hash;
pub mod key;
pub mod keygen;
pub mod license;

pub use channel::{Channel, ChannelKind};
pub use cipher::Cipher;
pub use contract::{Contract, ContractCache, ContractProvider, SingleContractProvider, UsageStats};
pub use hash::{WILDCARD, hash};
pub use key::{Access, KEY_LEN, Key};
pub use keygen::KeyGenerator;
pub use license::License;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("malformed key")]
    MalformedKey,
    #[error("malformed license")]
    MalformedLicense,
    #[error("key expired")]
    Expired,
    #[error("invalid channel")]
    InvalidChannel,
}

// UNIX seconds; keys and windows use second precision on the wire.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
