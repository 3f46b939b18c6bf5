//! Shared types for the parcel download service: byte ranges, coverage
//! accounting, token records and service configuration.

pub mod config;
pub mod coverage;
pub mod range;
pub mod token;

pub use config::{ConfigError, ParcelConfig};
pub use coverage::CoverageSet;
pub use range::{parse_single_byte_range, resolve_range, ByteRange, RangeError, ResolvedRange};
pub use token::{DownloadToken, ReleaseOutcome, TokenState};
