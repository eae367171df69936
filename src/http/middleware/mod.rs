pub mod lifecycle_gate;

pub use lifecycle_gate::lifecycle_gate;
