//! Middleware to log requests in Common Log Format.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use hyper::header::CONTENT_LENGTH;
use log::{log, log_enabled, Level};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::handler::{Handler, HandlerFuture};
use crate::middleware::Middleware;
use crate::state::State;

/// A logging middleware emitting one
/// [Common Log Format](https://en.wikipedia.org/wiki/Common_Log_Format) line
/// per completed request.
#[derive(Copy, Clone)]
pub struct Logger {
    level: Level,
}

impl Logger {
    /// Creates a new `Logger` using the provided log level.
    pub fn new(level: Level) -> Logger {
        Logger { level }
    }
}

impl Middleware for Logger {
    fn call(&self, state: State, next: Arc<dyn Handler>) -> Pin<Box<HandlerFuture>> {
        // skip everything if logging is disabled
        if !log_enabled!(self.level) {
            return next.handle(state);
        }

        let level = self.level;
        let start_time = OffsetDateTime::now_utc();

        next.handle(state)
            .map(move |result| {
                if let Ok((state, response)) = &result {
                    let datetime = start_time
                        .format(format_description!(
                            "[day]/[month repr:short]/[year]:[hour]:[minute]:[second] +0000"
                        ))
                        .unwrap_or_default();

                    let ip = state
                        .client_addr()
                        .map(|addr| addr.ip().to_string())
                        .unwrap_or_else(|| "-".to_string());

                    let length = response
                        .headers()
                        .get(CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();

                    log!(
                        level,
                        "{} - - [{}] \"{} {} {:?}\" {} {}",
                        ip,
                        datetime,
                        state.method(),
                        state.uri(),
                        state.version(),
                        response.status().as_u16(),
                        length
                    );
                }

                result
            })
            .boxed()
    }
}
