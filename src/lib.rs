pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod models;
pub mod relay;
pub mod routes;
pub mod services;
