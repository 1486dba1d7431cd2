use std::path::PathBuf;

use clap::Parser;

/// The cli of iked
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Cli {
    /// Internal: run as the given child process
    #[clap(short = 'P', hide = true)]
    pub proc: Option<String>,

    /// The serialized configuration object to load
    #[clap(short = 'f', default_value = "/etc/iked/iked.json")]
    pub config: PathBuf,

    /// The local private key in PKCS#8 DER form
    #[clap(short = 'k')]
    pub key: Option<PathBuf>,

    /// Path of the administrative control socket
    #[clap(short = 's', default_value = "/var/run/iked.sock")]
    pub control: PathBuf,

    /// Log protocol details
    #[clap(short, long)]
    pub verbose: bool,
}
