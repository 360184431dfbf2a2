pub mod catalog;
pub mod config;
pub mod join;
pub mod pipeline;
pub mod sink;
pub mod table;
pub mod util;
