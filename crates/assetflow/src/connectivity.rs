//! Network reachability signal.
//!
//! [`Connectivity`] is a shared boolean that network sources consult before
//! starting a request. It can be flipped by hand (tests, platform hooks) or
//! driven by a background TCP probe started with
//! [`spawn_probe`](Connectivity::spawn_probe).

use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{net::TcpStream, sync::watch};
use tokio_util::sync::CancellationToken;

/// How long a single probe connect may take before it counts as down.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Cloneable handle to the reachability signal.
#[derive(Clone, Debug)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
    probe: Arc<Mutex<Option<CancellationToken>>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(up: bool) -> Self {
        let (tx, _rx) = watch::channel(up);
        Self {
            tx: Arc::new(tx),
            probe: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_up(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set(&self, up: bool) {
        let _was = self.tx.send_replace(up);

        #[cfg(feature = "tracing")]
        if _was != up {
            tracing::info!(up, "Connectivity changed");
        }
    }

    /// Watches every change to the signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Starts probing `addr` with a TCP connect every `interval`, replacing any
    /// probe already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a Tokio runtime.
    pub fn spawn_probe(&self, addr: impl Into<String>, interval: Duration, timeout: Duration) {
        let addr = addr.into();
        let token = CancellationToken::new();
        if let Some(previous) = self.probe.lock().replace(token.clone()) {
            previous.cancel();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%addr, ?interval, "Starting connectivity probe");

        let signal = self.clone();
        tokio::spawn(async move {
            loop {
                let up = tokio::select! {
                    () = token.cancelled() => break,
                    up = probe(&addr, timeout) => up,
                };
                signal.set(up);

                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    /// Stops the background probe, if any. The signal keeps its last value.
    pub fn stop_probe(&self) {
        if let Some(token) = self.probe.lock().take() {
            token.cancel();
        }
    }
}

async fn probe(addr: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(_e)) => {
            #[cfg(feature = "tracing")]
            tracing::trace!(%addr, error = %_e, "Connectivity probe failed");
            false
        }
        Err(_elapsed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn manual_toggle_is_observed() {
        let signal = Connectivity::new(true);
        let mut rx = signal.subscribe();
        signal.set(false);
        assert!(!signal.is_up());
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn probe_tracks_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let signal = Connectivity::new(false);
        let mut rx = signal.subscribe();
        signal.spawn_probe(addr, Duration::from_millis(20), Duration::from_secs(1));

        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|up| *up))
            .await
            .unwrap()
            .unwrap();
        signal.stop_probe();
        assert!(signal.is_up());
    }
}
