//! qrlog — recovers kernel logs transported as QR-encoded zstd frames.
//!
//! Two modes share the same decoder:
//!
//! - **Bulk**: decode a JSON export, hex dump or binary frame supplied at once.
//! - **Monitor**: poll a scanner app's history database and write each
//!   capture session to a numbered log file.

pub mod batch;
pub mod capture;
pub mod colorize;
pub mod config;
pub mod flush;
pub mod frame;
pub mod session;
pub mod shutdown;
pub mod store;
