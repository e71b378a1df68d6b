//! Test support shared by the unit tests and the `simulate` command

pub mod simulator;

pub use simulator::{GapEvent, PathShift, SimulatorConfig, StampSimulator};
