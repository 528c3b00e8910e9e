mod root;
mod types;

pub use root::{
    ClientConfig, RelayConfig, DEFAULT_DOH_URL, DEFAULT_ECH_DOMAIN, DEFAULT_LISTEN, DEFAULT_TOKEN,
};
pub use types::RoutingMode;
