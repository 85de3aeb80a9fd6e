pub mod api_error;
pub mod auth;
pub mod http_api;
pub mod webhook;
