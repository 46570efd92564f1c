//! HTTP front end: the admission middleware and the server that runs it.

mod middleware;
mod server;

pub use middleware::{
    admission_middleware, API_KEY_HEADER, INTERNAL_ERROR_BODY, QUOTA_EXCEEDED_BODY,
};
pub use server::{with_admission, HttpServer};
