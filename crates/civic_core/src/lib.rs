pub mod db;
pub mod engine;
pub mod error;
pub mod geo;
pub mod policy;
pub mod ratings;
pub mod schema;
pub mod scoring;
pub mod verification;
pub mod votes;

pub use engine::{Engine, EngineSnapshot};
pub use error::{EngineError, EngineResult};
pub use policy::Policy;
