//! Panic supervision for actor tasks
//!
//! An actor owns its maps exclusively; if its loop panics halfway through a
//! message those maps may be inconsistent and nothing else can repair them.
//! A panic is therefore logged and, unless the actor was already asked to
//! close, takes the whole process down.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Last fatal error recorded by an actor, readable from its handle
pub type LastError = Arc<Mutex<Option<String>>>;

/// Exit code used when an actor dies while still in service
pub const PANIC_EXIT_CODE: i32 = 70;

pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

/// Spawn `actor` and watch it for panics.
///
/// `closed` is set once the task ends, however it ends.
pub fn spawn_supervised<F>(
    name: String,
    closed: Arc<AtomicBool>,
    last_error: LastError,
    actor: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(actor).catch_unwind().await {
            let msg = format!(
                "[panic]{}\n{}",
                panic_message(panic.as_ref()),
                Backtrace::force_capture()
            );
            error!("{name}: {msg}");
            *last_error.lock() = Some(msg);

            if !closed.load(Ordering::SeqCst) {
                error!("{name} died while in service, exiting");
                std::process::exit(PANIC_EXIT_CODE);
            }
        }

        debug!("{name} is exit.");
        closed.store(true, Ordering::SeqCst);
    })
}
