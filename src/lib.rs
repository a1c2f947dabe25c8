//! Tracksocks - rewriting forward proxy
//!
//! ## Features
//!
//! - HTTP and HTTPS listeners, optionally behind header obfuscation
//! - On-the-fly leaf certificates signed by an embedded intermediate CA
//! - URL rewrite and redirect rules, HTML and JavaScript body rewriting
//! - Round-robin upstream pool of SOCKS5 and shadowsocks-style tunnels
//! - Stream ciphers (RC4, DES-CFB, AES-CFB) on upstream connections
//! - Rules and upstream settings polled from remote JSON documents

pub mod config;
pub mod context;
pub mod crypto;
pub mod dialer;
pub mod error;
pub mod models;
pub mod obfuscation;
pub mod proxy;
pub mod rules;
pub mod services;
pub mod shutdown;
pub mod tls;

pub use config::Config;
pub use context::ProxyContext;
pub use error::{ProxyError, Result};
