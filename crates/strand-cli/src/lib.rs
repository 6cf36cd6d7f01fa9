//! strand-cli: command-line front end for the Strand graph engine.
//!
//! Opens a JSON snapshot as local storage, stamps a passport, and runs
//! schema, mutation, query, and delete requests read from JSON files.

pub mod commands;
pub mod error;
pub mod persist;
