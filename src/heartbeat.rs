//! Heartbeat liveness monitor.
//!
//! Constructed with the negotiated interval and two activity probes. Each
//! tick it swaps the probes:
//!
//! - nothing was *sent* during the last interval → emit [`Pulse::Beat`] so
//!   the owner writes a heartbeat frame (regular traffic suppresses beats);
//! - nothing was *received* for two consecutive intervals → emit
//!   [`Pulse::Timeout`] and stop. The owner treats this as a fatal
//!   unsolicited close.
//!
//! The monitor never touches the transport itself; it only observes the
//! activity flags and signals through the pulse channel.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Activity probe: returns whether anything happened since the last call
/// and resets the underlying flag.
pub type ActivityProbe = Box<dyn FnMut() -> bool + Send>;

/// Signal emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    /// The send side was idle for an interval; write a heartbeat frame now.
    Beat,
    /// No inbound activity for two intervals; the peer is presumed dead.
    Timeout,
}

/// Handle to a running monitor.
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop the monitor. No pulses are emitted after this returns.
    pub fn clear(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn a monitor ticking every `interval_secs`.
///
/// Callers must not spawn a monitor for a zero interval; a negotiated
/// heartbeat of 0 means heartbeating is disabled.
pub fn spawn(
    interval_secs: u16,
    mut send_probe: ActivityProbe,
    mut recv_probe: ActivityProbe,
) -> (HeartbeatHandle, mpsc::Receiver<Pulse>) {
    debug_assert!(interval_secs > 0);

    let (tx, rx) = mpsc::channel(4);
    let period = Duration::from_secs(u64::from(interval_secs));

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick fires immediately; skip it so probes cover a full period.
        ticker.tick().await;

        let mut missed_recv: u8 = 0;
        loop {
            ticker.tick().await;

            if recv_probe() {
                missed_recv = 0;
            } else {
                missed_recv += 1;
                if missed_recv >= 2 {
                    tracing::warn!(interval_secs, "heartbeat timeout");
                    let _ = tx.send(Pulse::Timeout).await;
                    return;
                }
            }

            if !send_probe() {
                tracing::trace!("idle interval, requesting heartbeat");
                if tx.send(Pulse::Beat).await.is_err() {
                    return;
                }
            }
        }
    });

    (HeartbeatHandle { task }, rx)
}
