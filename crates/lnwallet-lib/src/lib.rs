mod config;
pub use config::Config;

#[cfg(test)]
pub mod tests;

use lightning::types::Hash256;
use rand::Rng;
#[cfg(test)]
pub use tests::*;

pub mod lightning;
pub use lightning::{
    events::{EventBus, WalletEvent},
    network::NetworkService,
    LightningConfig,
};

pub mod invoice;
pub mod store;

mod errors;
pub use errors::{Error, Result};

pub mod tasks;

pub fn now_timestamp_as_millis_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("Duration since unix epoch")
        .as_millis() as u64
}

pub fn gen_rand_sha256_hash() -> Hash256 {
    let mut rng = rand::thread_rng();
    let mut result = [0u8; 32];
    rng.fill(&mut result[..]);
    result.into()
}

pub mod macros {
    #[macro_export]
    macro_rules! unwrap_or_return {
        ($expr:expr, $msg:expr) => {
            match $expr {
                Ok(val) => val,
                Err(err) => {
                    tracing::error!("{}: {:?}", $msg, err);
                    return;
                }
            }
        };
        ($expr:expr) => {
            match $expr {
                Ok(val) => val,
                Err(err) => {
                    tracing::error!("{:?}", err);
                    return;
                }
            }
        };
    }
}
