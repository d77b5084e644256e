pub mod config;
pub mod constants;
pub mod errors;
pub mod logging;
pub mod materialize;
pub mod model;
pub mod pipeline;
pub mod resolver;
pub mod store;
pub mod template;
pub mod usage;
