pub mod db;
pub mod models;
pub mod nutrients;
pub mod recalc;
pub mod reconcile;
pub mod service;
pub mod table_import;
