use std::{fs::File, path::Path};

use nix::sched::{CloneFlags, setns};
use tracing::trace;

use super::CaptureError;

/// Run `f` on a dedicated thread inside the network namespace of `pid`.
///
/// Sockets opened by `f` stay bound to that namespace after the thread
/// has switched back.
pub fn in_netns<T, F>(procfs: &Path, pid: u32, f: F) -> Result<T, CaptureError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CaptureError> + Send + 'static,
{
    let netns_err = move |reason: String| CaptureError::Netns { pid, reason };
    let target = File::open(procfs.join(pid.to_string()).join("ns/net"))
        .map_err(|e| netns_err(format!("open: {e}")))?;

    let handle = std::thread::Builder::new()
        .name(format!("netns-{pid}"))
        .spawn(move || {
            let original = File::open("/proc/thread-self/ns/net")
                .map_err(|e| netns_err(format!("open current: {e}")))?;
            setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| netns_err(format!("setns: {e}")))?;
            trace!(event.name = "netns.entered", pid, "entered network namespace");

            let result = f();

            // The thread exits right after; a failed restore cannot leak
            setns(&original, CloneFlags::CLONE_NEWNET)
                .map_err(|e| netns_err(format!("restore: {e}")))?;
            result
        })
        .map_err(|e| netns_err(format!("spawn: {e}")))?;

    handle
        .join()
        .map_err(|_| netns_err("attach thread panicked".to_string()))?
}
