//! Core library for `crew`, a parallel work-stealing coordinator that drives
//! a shared task tracker to completion through a pool of isolated LLM agent
//! workers.
//!
//! The crate is organised around the process topology: a [`coordinator`]
//! supervises N worker subprocesses, each [`worker`] claims tasks from the
//! shared [`queue`] and executes them through an [`engine`] session whose
//! context consumption is bounded by a [`context`] budget and whose timeline
//! is persisted by the [`recorder`] for later [`replay`].

pub mod context;
pub mod coordinator;
pub mod engine;
pub mod notify;
pub mod protocol;
pub mod queue;
pub mod recorder;
pub mod replay;
pub mod worker;
