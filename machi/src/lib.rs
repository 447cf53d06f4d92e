#![cfg_attr(docsrs, feature(doc_cfg))]
//! Orkestra is the core orchestration engine behind a headless, multi-channel
//! agent runtime: a secret vault, an append-only workflow event log, a cron
//! scheduler, a tool registry, a subagent registry, an approval service, and
//! the router that ties them together.

extern crate self as orkestra;

pub mod approval;
pub mod cron;
pub mod error;
pub mod events;
pub mod message;
pub mod ops;
pub mod providers;
pub mod router;
pub mod secrets;
pub mod stream;
pub mod subagent;
pub mod tool;
