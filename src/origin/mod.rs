//! Network access to the origin server the cache fronts.
//!
//! A non-2xx status is a normal response here; only transport failures
//! (refused connection, timeout, DNS) are errors.

mod client;

pub use client::OriginClient;
