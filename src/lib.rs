//! Legacy cache proxy - reverse proxy that sets `Cache-Control` lifetimes
//! for legacy publishing content.
//!
//! Every request is routed to one of three upstreams (primary content
//! service, release calendar, search controller). Cacheable responses get a
//! `max-age`/`s-maxage` derived from the canonical page path and the page's
//! scheduled release time, so pages expire from caches when they are
//! published.
//!
//! # Request path
//!
//! 1. [`routing`] picks the upstream from the request path
//! 2. [`forwarder`] streams the request and response
//! 3. [`decorator`] decides cacheability and asks [`cache_policy`] for the TTL
//! 4. [`server`] serves connections, caps concurrency and drains on shutdown

pub mod cache_policy;
pub mod config;
pub mod decorator;
pub mod error;
pub mod forwarder;
pub mod lifecycle;
pub mod logging_layer;
pub mod proxy_service;
pub mod routing;
pub mod server;
pub mod timeout;
