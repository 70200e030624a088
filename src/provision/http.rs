//! Static HTTP server for the installer: media tree, kickstart or
//! ignition payloads and `authorized_keys`.
//!
//! It runs in its own process (`dpu-provision serve-http`) so it can be
//! supervised and killed like the other daemons.
use super::services::Service;
use crate::error::Error;
use log::info;
use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};
use warp::Filter;

/// Serves `root` on every address of the host until the process dies.
pub fn serve_blocking(root: PathBuf, port: u16) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(serve(root, port));
    Ok(())
}

pub async fn serve(root: PathBuf, port: u16) {
    info!("http: serving {} on port {}", root.display(), port);
    let files = warp::get().and(warp::fs::dir(root)).with(warp::log("dpu_provision::http"));
    warp::serve(files).run((Ipv4Addr::UNSPECIFIED, port)).await;
}

/// This executable, re-invoked as the HTTP daemon.
pub fn service(root: &Path, port: u16) -> Result<Service, Error> {
    let exe = std::env::current_exe()?;
    Ok(Service::new("http", &exe.to_string_lossy()).args(vec![
        String::from("serve-http"),
        String::from("--root"),
        root.to_string_lossy().into_owned(),
        String::from("--port"),
        port.to_string(),
    ]))
}
