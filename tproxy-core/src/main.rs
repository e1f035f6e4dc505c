//! # Traffic-Shaping Tunnel Proxy
//!
//! One binary, two roles. As the client-side proxy it terminates SOCKS5
//! next to the browser and multiplexes every connection over a single
//! long-lived carrier to the server side, shaped into fixed-size cells on
//! a fixed schedule while a defense session is active. As the server-side
//! proxy it demultiplexes the carrier and dials the real targets.
//!
//! ## Architecture
//!
//! - **System layer**: the carrier channel (cells, multiplexer, defense
//!   scheduler), the control-plane protocol and signal handling
//! - **App layer**: the SOCKS5 front-end, the target connector and the
//!   shared forwarder
//! - **Config**: command line and config file parsing with validation
//!
//! Everything runs on a single-threaded runtime; each carrier channel is
//! an actor that exclusively owns its socket and state.

mod app;
mod config;
mod system;

use anyhow::Result;

use crate::app::csp::ClientSideProxy;
use crate::app::ssp::ServerSideProxy;
use crate::config::Role;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let exit_code = match run() {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

#[tokio::main(flavor = "current_thread")]
async fn run() -> Result<i32> {
    let cfg = config::load()?;
    match cfg.role {
        Role::Client { .. } => {
            let proxy = ClientSideProxy::bind(cfg).await?;
            proxy.run().await
        }
        Role::Server => {
            let proxy = ServerSideProxy::bind(cfg).await?;
            proxy.run().await
        }
    }
}
