//! The four control-loop state machines. Each owns its own statistics
//! and persists a single row per scheduler tick, mirroring the teacher
//! component's own snapshot style.

pub mod chemicals;
pub mod filter;
pub mod level;
pub mod lights;

pub use chemicals::ChemicalsAlgorithm;
pub use filter::FilterAlgorithm;
pub use level::LevelAlgorithm;
pub use lights::LightsAlgorithm;
