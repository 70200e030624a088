//! SIGUSR1 ends the console watch early.
//!
//! An operator watching the install in the transcript can `kill -USR1`
//! the process to stop pumping the console and go straight to the
//! liveness checks. The flag is only read between reads of the console;
//! no serial operation is ever interrupted.
use crate::error::Error;
use log::info;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tokio::signal::unix::{signal, SignalKind};

/// Returns a flag raised (once, and for good) when SIGUSR1 arrives.
pub fn release_on_sigusr1() -> Result<Arc<AtomicBool>, Error> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    // The handler must be installed before we return, not whenever the
    // helper thread gets scheduled.
    let mut usr1 = {
        let _entered = runtime.enter();
        signal(SignalKind::user_defined1())?
    };

    let released = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&released);
    thread::Builder::new().name(String::from("sigusr1")).spawn(move || {
        runtime.block_on(async move {
            if usr1.recv().await.is_some() {
                info!("Received SIGUSR1: stop watching the console");
                flag.store(true, Ordering::SeqCst);
            }
        })
    })?;
    Ok(released)
}
