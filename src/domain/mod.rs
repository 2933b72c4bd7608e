//! 领域层模块

pub mod model;
pub mod normalizer;
pub mod repository;
pub mod service;

pub use model::*;
pub use repository::*;
