// =============================================================================
// Matrixon Matrix NextServer - Clap Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Command line interface of the sliding sync binary.
//
// =============================================================================

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version, name = "matrixon-sliding-sync")]
pub struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "MATRIXON_SLIDING_SYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level regardless of the configured filter
    #[clap(short, long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Drive long-polling clients against an in-memory room store
    Simulate {
        /// Number of simulated users, each with one connection
        #[clap(long, default_value_t = 3)]
        users: usize,

        /// Number of rooms every user joins
        #[clap(long, default_value_t = 12)]
        rooms: usize,

        /// Rounds of room activity
        #[clap(long, default_value_t = 20)]
        rounds: usize,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
