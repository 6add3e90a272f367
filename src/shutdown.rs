use log::{error, info};
use std::time::Duration;
use tokio::sync::watch;

/// Cooperative stop flag threaded through the consumer loop.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested. Never resolves if the trigger was dropped unfired.
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleeps for `duration` unless stop is requested first.
    /// Returns `false` when the sleep was cut short.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.requested() => false,
        }
    }
}

/// Waits for SIGTERM/SIGINT/SIGQUIT (ctrl-c elsewhere) and returns its name.
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal;

    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};
        let (mut sigterm, mut sigint, mut sigquit) = match (
            unix_signal(SignalKind::terminate()),
            unix_signal(SignalKind::interrupt()),
            unix_signal(SignalKind::quit()),
        ) {
            (Ok(t), Ok(i), Ok(q)) => (t, i, q),
            _ => {
                error!("✗ failed to register signal handlers; falling back to ctrl-c");
                return match signal::ctrl_c().await {
                    Ok(()) => "CTRL+C",
                    Err(_) => std::future::pending().await,
                };
            }
        };

        // recv() yields None only if the stream closes; keep waiting in that case.
        loop {
            tokio::select! {
                v = sigterm.recv() => if v.is_some() { break "SIGTERM" },
                v = sigint.recv() => if v.is_some() { break "SIGINT" },
                v = sigquit.recv() => if v.is_some() { break "SIGQUIT" },
            }
        }
    }

    #[cfg(not(unix))]
    {
        match signal::ctrl_c().await {
            Ok(()) => "CTRL+C",
            Err(_) => std::future::pending().await,
        }
    }
}

/// Fires `trigger` on the first termination signal.
pub fn install_signal_handler(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        let name = wait_for_signal().await;
        info!("received {}; finishing the current job before exit", name);
        trigger.trigger();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_trigger() {
        let (trigger, mut shutdown) = channel();
        assert!(shutdown.sleep(Duration::from_secs(1)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.trigger();
        });
        let start = tokio::time::Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(60));
        assert!(shutdown.is_requested());
        assert!(!shutdown.sleep(Duration::from_secs(1)).await);
    }
}
