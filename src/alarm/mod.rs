pub mod model;
pub mod occurrence;
pub mod scheduler;
pub mod store;
pub mod trigger;
