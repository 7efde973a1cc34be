pub mod config;
pub mod csv;
pub mod engine;
pub mod model;
pub mod points;
pub mod store;

pub use config::EngineConfig;
pub use engine::Engine;
pub use model::{Command, ReservationId, ShowDateId, UserId};
pub use points::Points;
pub use store::MemoryStore;
