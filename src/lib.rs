//! A single-threaded, nonblocking HTTP/1.1 server core.
//!
//! The event loop multiplexes every tracked descriptor through epoll,
//! accepts connections on the configured listen addresses, accumulates
//! request bytes per connection, parses them into [`request::HttpRequest`]
//! values (including `multipart/form-data` bodies via
//! [`form_data::FormData`]) and dispatches them to a
//! [`handler::RequestHandler`].

pub mod config;
pub mod error;
pub mod form_data;
pub mod handler;
pub mod request;
pub mod response;
pub mod server;
