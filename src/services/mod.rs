//! Background services

pub mod fetch;
pub mod rules_refresh;
pub mod upstream_refresh;

pub use fetch::{DocumentSource, HttpDocumentSource};
pub use rules_refresh::RulesRefreshService;
pub use upstream_refresh::UpstreamRefreshService;
