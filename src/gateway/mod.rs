//! HTTP surface of the gateway: routing, middleware, and the server.

mod assets;
mod handlers;
mod middleware;
mod router;
mod server;
mod tls;

pub use assets::SpaAssets;
pub use middleware::{PanicHandler, ProxyTrust, Throttle};
pub use router::{api_routes, build_router};
pub use server::{GatewayServer, LifecycleState};
pub use tls::load_acceptor;
