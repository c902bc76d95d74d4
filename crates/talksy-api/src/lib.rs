pub mod auth;
pub mod conversations;
pub mod error;
pub mod files;
pub mod middleware;
pub mod routes;
pub mod users;
