//! clawhost core library: config resolution, the openclaw command runner, the gateway
//! supervisor, the reverse proxy, and the setup/admin HTTP surface.

pub mod config;
pub mod exec;
pub mod proxy;
pub mod server;
pub mod setup;
pub mod supervisor;
