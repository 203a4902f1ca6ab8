pub mod app;
pub mod cache;
pub mod config;
pub mod connection;
pub mod domain;
pub mod entity;
pub mod error;
pub mod mirror;
pub mod openbis;
pub mod output;
pub mod reconcile;
pub mod repository;
