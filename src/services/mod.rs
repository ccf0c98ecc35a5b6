pub mod dispatcher;
pub mod operations;
pub mod registry;
pub mod staging;
