// HTTP control surface for the import pipeline

pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod registry;
pub mod routes;
pub mod server;
