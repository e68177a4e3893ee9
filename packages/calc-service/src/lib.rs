//! Calc service: range calculation served over a switchyard bus.
//!
//! - [`calc`]: messages, consumers and routes
//! - [`service`]: server and gateway wiring, generic over the transport
//! - [`config`]: environment configuration

pub mod calc;
pub mod config;
pub mod service;

pub use calc::{CalculateRange, GetLastRange, Range, RangeCalculated, RangeHistory};
pub use config::Config;
pub use service::{reply_router, CalcGateway, CalcServer};
