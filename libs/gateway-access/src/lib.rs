pub mod middleware;
pub mod route;

pub use middleware::{AuthenticatedUser, GatewayAccessControl};
pub use route::{authorize, Action, RouteTable};
