//! Intents driving the environment state machine.
//!
//! Every state change is the reconciler's answer to exactly one intent;
//! intents for a key are processed in arrival order by that key's worker.

pub mod environment;
