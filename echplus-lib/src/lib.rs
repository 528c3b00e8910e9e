#![forbid(unsafe_code)]

pub mod config;
pub mod ech;
pub mod engine;
pub mod error;
pub mod geoip;
pub mod listener;
pub mod relay;
pub mod routing;
pub mod session;
pub mod stats;

pub use config::{ClientConfig, RelayConfig, RoutingMode};
pub use ech::{EchManager, EchProvider, RelayConnector, RelayStream};
pub use engine::Engine;
pub use error::{EchError, Result};
pub use geoip::CnIpDatabase;
pub use routing::{Resolver, RouteDecider, SystemResolver};
pub use stats::TrafficStore;
