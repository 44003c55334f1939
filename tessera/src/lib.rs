//! Chunk allocation for persistent stores.
//!
//! A store is a flat array of bytes, divided into chunks.
//! Each chunk starts with a variable-width header
//! recording its capacity, how many bytes are used,
//! and optionally a link to the next chunk of its chain.
//! Chains let data outgrow the chunk it was first written to.
//!
//! The [`ChunkManager`] hands out chunks for [`Ticket`]s,
//! grows chains when they run out of room,
//! and takes freed chunks back, merging them with their neighbors
//! and shrinking the store when free space collects at its end.
//! Allocation and growth try a fixed sequence of strategies,
//! cheapest first, until one of them succeeds.
//!
//! Every structural change happens under one lock.
//! Threads that read or write chain contents
//! register themselves with the [`ActivityTracker`],
//! so that chunks in use are not freed or moved from under them.

#![warn(missing_docs)]

pub use self::{
    activity::*,
    chain::*,
    chunk::*,
    config::*,
    error::*,
    free_list::*,
    listener::*,
    manager::*,
    store::*,
    ticket::*,
    width::*,
};

mod activity;
mod chain;
mod chunk;
mod config;
mod error;
mod free_list;
mod listener;
mod manager;
mod merge;
mod store;
mod strategy;
mod ticket;
mod width;

pub mod verify;
