//! Definition authoring: YAML DTOs and deployment-time validation.

pub mod dto;
pub mod validate;
pub mod yaml;
