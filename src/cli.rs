//! Command-line surface for the `autotls-demo` binary. A deliberately small CLI: most
//! configuration lives in `autotls.toml` / `ACMETLS_*` env vars (see [`crate::config`]);
//! these flags exist for the handful of settings worth overriding ad hoc.

use std::path::PathBuf;

use clap::Parser;

use crate::config::ServerType;

#[derive(Debug, Parser)]
#[command(name = "autotls-demo", about = "Opportunistic ACME HTTP-01 TLS provisioning")]
pub struct Args {
    /// Path to an `autotls.toml` configuration file.
    #[arg(long, env = "ACMETLS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Domain(s) to serve and provision a certificate for. Repeat for multiple domains.
    #[arg(long = "domain", value_name = "DOMAIN")]
    pub domains: Vec<String>,

    /// Which ACME endpoint to provision against.
    #[arg(long, value_enum)]
    pub server: Option<ServerType>,

    /// Contact email submitted with account registration.
    #[arg(long)]
    pub email: Option<String>,

    /// Root directory for account/certificate state.
    #[arg(long)]
    pub root: Option<PathBuf>,
}
