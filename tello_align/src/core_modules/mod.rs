pub mod alignment;
pub mod command;
pub mod controller;
pub mod display;
pub mod drone;
pub mod ledger;
pub mod orchestrator;
pub mod perception;
pub mod planner;
pub mod transport;
pub mod video;
