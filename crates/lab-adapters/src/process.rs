//! Child-process helpers shared by the adapters.

use tokio::io::{AsyncBufRead, Lines};
use tokio::process::Child;

/// Next line of an optional reader; `None` on EOF or read error.
pub(crate) async fn next_line<R: AsyncBufRead + Unpin>(
    lines: &mut Option<Lines<R>>,
) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// Asks a child to stop the way a terminal Ctrl-C would.
pub(crate) fn interrupt(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let pid = Pid::from_raw(pid as i32);
            if let Err(e) = kill(pid, Signal::SIGINT) {
                tracing::warn!("Failed to send SIGINT: {}", e);
            }
            return;
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!("Process already gone: {}", e);
    }
}
