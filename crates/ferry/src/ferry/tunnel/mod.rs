//! Tunnel core: per-client socket pools, the client lifecycle around them,
//! the registry of live clients, and the endpoint clients dial into.

pub mod acceptor;
pub mod client;
pub mod pool;
pub mod registry;
