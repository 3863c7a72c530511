pub mod hasher;
pub mod logger;
pub mod net;
pub mod stats;
pub mod tracer;
pub mod watchdog;
