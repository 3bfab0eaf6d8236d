//! gilstats - per-thread interpreter lock contention for running Python processes
//!
//! Entry and return probes on the libc call the interpreter lock blocks
//! in are paired per thread, folded into per-(thread, lock) totals, and
//! the interpreter lock is picked out of every lock seen at that call
//! site by its call count.

pub mod aggregate;
pub mod cli;
pub mod collector;
pub mod correlation;
pub mod error;
pub mod lock_identity;
pub mod report;
pub mod runtime;
pub mod symbols;
pub mod tracer;
pub mod uprobe;
