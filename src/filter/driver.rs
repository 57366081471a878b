//! The filter thread: wakes whenever the DAQ advances and runs one
//! incremental pass over the graph. It never blocks on the procedure
//! thread; configure and auto-configure calls from the macro
//! interpreter take the same lock between passes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::{debug, error};
use parking_lot::Mutex;

use crate::filter::graph::FilterGraph;

/// Idle poll interval when no advance notification arrives.
const IDLE_POLL: Duration = Duration::from_millis(100);

pub fn start(
    graph: Arc<Mutex<FilterGraph>>,
    advance: Receiver<()>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("filter".to_string())
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                match advance.recv_timeout(IDLE_POLL) {
                    Ok(()) => {
                        if let Err(e) = graph.lock().process() {
                            error!("filter pass failed: {e}");
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            graph.lock().close();
            debug!("filter thread stopped");
        })
        .expect("spawning the filter thread")
}
