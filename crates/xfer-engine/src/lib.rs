pub mod engine;

pub use engine::facade::Engine;
