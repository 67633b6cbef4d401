//! Multi-transport RPC gateway core: peers, sessions, plugins, proxying and
//! the socket/HTTP/WebSocket transports.

pub mod auth;
pub mod business;
pub mod client;
pub mod config;
pub mod discovery;
pub mod gateway;
pub mod inner;
pub mod plugin;
pub mod proxy;
pub mod router;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;
pub mod wire;

/// Auth handshake and push gate plugins backed by [`Business`].
pub use auth::{AuthHandshake, PushGate};
/// Pluggable business strategy and its default.
pub use business::{Business, DefaultBusiness};
/// Startup configuration.
pub use config::{GatewayConfig, HttpSrvConfig, ListenAddr, PeerConfig, SrvConfig, WsSrvConfig};
/// Service discovery interface and in-memory registry.
pub use discovery::{Discovery, DiscoveryEvent, Instance, MemoryDiscovery};
/// Gateway context and listener orchestration.
pub use gateway::{Gateway, GatewayBuilder, RunningGateway};
/// Plugin capabilities and container.
pub use plugin::{
    AuthCheckHook, Capability, Handshake, HeartbeatHook, Plugin, PluginContainer, PluginRecord,
    Position, PreWritePushHook, PushCtx,
};
/// Backend resolution with lease-aware caching.
pub use proxy::{ProxySelector, ProxyTarget};
/// Handler routing.
pub use router::{BindErrorFn, CallCtx, CallHandler, PushHandler, Router};
/// Peer wrapper.
pub use server::{Listener, Server, ServerBuilder};
/// Live sessions.
pub use session::{AuthState, Session, SessionTable};
/// Frame I/O traits and socket framing.
pub use wire::{FrameRead, FrameWrite, split_stream};
