use clap::Parser;
use std::path::PathBuf;

/// Privileged disk-operations helper. Reads one JSON request, streams
/// progress and log events as JSON lines, then prints the final response.
#[derive(Debug, Parser)]
#[command(name = "oxidisk-helper", version, about)]
pub struct Args {
    /// Read the request from a file instead of stdin.
    #[arg(long)]
    pub request_file: Option<PathBuf>,

    /// Override the operation journal location.
    #[arg(long)]
    pub journal_path: Option<PathBuf>,

    /// Override the sudoers fragment location.
    #[arg(long)]
    pub sudoers_path: Option<PathBuf>,

    /// Enable the experimental ext4/ntfs resize paths.
    #[arg(long)]
    pub experimental_resize: bool,
}
