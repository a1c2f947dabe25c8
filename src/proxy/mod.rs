//! Proxy server implementation
//!
//! This module provides the proxy server functionality including:
//! - HTTP and TLS-terminating listeners with restart supervision
//! - CONNECT tunnels through the upstream pool
//! - Rule-driven request redirection and response rewriting
//! - Forwarding with one retry

pub mod engine;
pub mod handler;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use handler::{ProxyHandler, Scheme};
pub use server::{ListenerConfig, ProxyServer};
pub use transport::{ProxyBody, Transport};
pub use tunnel::TunnelHandler;
