//! CLI argument definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use corral_core::ResourceType;

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Corral container resource manager", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Container name plus the resources to act on
#[derive(Args, Debug)]
pub struct Target {
    /// Absolute container name, e.g. /batch/job-7
    pub name: String,

    /// Resources to act on (default: every resource)
    #[arg(short, long = "resource", value_name = "RESOURCE", value_delimiter = ',')]
    pub resources: Vec<ResourceType>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Mount and tune every cgroup hierarchy
    InitMachine {
        /// Machine layout as JSON (default: one hierarchy per resource under /sys/fs/cgroup)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show the cgroup hierarchies mounted on this machine
    Mounts,

    /// Create a container
    Create {
        #[command(flatten)]
        target: Target,

        /// Container spec as JSON, or @FILE
        #[arg(short, long, default_value = "{}")]
        spec: String,
    },

    /// Change a container's configuration
    Update {
        #[command(flatten)]
        target: Target,

        /// Container spec as JSON, or @FILE
        #[arg(short, long)]
        spec: String,

        /// Reset every setting the spec leaves out
        #[arg(long)]
        replace: bool,
    },

    /// Print a container's live configuration
    Spec {
        #[command(flatten)]
        target: Target,
    },

    /// Print container statistics
    Stats {
        #[command(flatten)]
        target: Target,

        /// Include expensive statistics
        #[arg(long)]
        full: bool,
    },

    /// Move threads into a container
    Enter {
        #[command(flatten)]
        target: Target,

        /// Thread ids (default: this process)
        #[arg(short, long = "tid", value_delimiter = ',')]
        tids: Vec<i32>,
    },

    /// Destroy a container
    Destroy {
        #[command(flatten)]
        target: Target,
    },

    /// Wait for container events
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("event").required(true).args(["oom", "threshold_mb", "empty"])))]
pub struct WatchArgs {
    /// Absolute container name
    pub name: String,

    /// Out-of-memory kills
    #[arg(long)]
    pub oom: bool,

    /// Memory usage reaching this many megabytes
    #[arg(long, value_name = "MB")]
    pub threshold_mb: Option<u64>,

    /// Last task leaving the container
    #[arg(long)]
    pub empty: bool,

    /// Stop after this many events
    #[arg(short = 'n', long, default_value = "1")]
    pub count: u64,
}
