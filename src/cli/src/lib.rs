//! A3S Diff CLI - apply layer diffs from the command line.

pub mod commands;
