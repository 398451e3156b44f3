//! A collection of useful traits and macros that should always be imported.

#[cfg(feature = "derive")]
pub use trellis_derive::{Bind, StateData};

pub use crate::handler::{Handler, HandlerError, IntoHandlerFuture, IntoResponse};
pub use crate::middleware::Middleware;
pub use crate::router::builder::DrawRoutes;
