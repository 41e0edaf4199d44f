pub mod apiservice;
pub mod certs;
pub mod cluster;
pub mod controller;
pub mod crd;
pub mod ownership;
pub mod rbac;
pub mod utils;

pub const OPERATOR_NAME: &str = "apiservice.stackable.tech";
