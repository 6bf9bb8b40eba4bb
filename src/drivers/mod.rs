//! Vendor drivers
//!
//! | Driver | Transport | Vendors |
//! |--------|-----------|---------|
//! | [`RegisterCharger`] | [`RegisterTransport`](crate::transport::RegisterTransport) | KEBA, Amperfied, ABL, Vestel, generic |
//! | [`JsonCharger`] | [`ValueTransport`](crate::transport::ValueTransport) | openWB Pro |

pub mod json;
pub mod profiles;
pub mod register;
pub mod wakeup;

pub use json::{JsonCharger, JsonOptions};
pub use register::{RegisterCharger, RegisterMap, RegisterOptions};
pub use wakeup::WakeUpWindow;
