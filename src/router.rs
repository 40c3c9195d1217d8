//! Management frame routing
//!
//! A join step registers interest in a set of management subtypes (plus an
//! optional predicate such as "probe response carrying my SSID") and
//! receives matching frames over a typed bounded channel with a
//! receive-with-timeout operation. Frames no waiter claims are appended to
//! a bounded indication queue for asynchronous consumers; when the queue is
//! full the oldest entry is dropped so a hostile or noisy RF environment
//! cannot grow memory without bound.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::frame::{ManagementFrame, ManagementSubtype};

/// Predicate a registered waiter applies on top of its subtype filter
pub type FramePredicate = Box<dyn Fn(&ManagementFrame) -> bool + Send + Sync>;

struct Waiter {
    id: u64,
    subtypes: Vec<ManagementSubtype>,
    predicate: FramePredicate,
    sender: mpsc::Sender<ManagementFrame>,
}

impl Waiter {
    fn matches(&self, frame: &ManagementFrame) -> bool {
        self.subtypes.contains(&frame.subtype) && (self.predicate)(frame)
    }
}

#[derive(Default)]
struct RouterInner {
    waiter: Option<Waiter>,
    pending: VecDeque<ManagementFrame>,
    next_waiter_id: u64,
    dropped: u64,
}

/// Routes inbound management frames to the current waiter or the
/// indication queue
pub struct ManagementFrameRouter {
    inner: Arc<Mutex<RouterInner>>,
    capacity: usize,
}

impl ManagementFrameRouter {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(RouterInner::default())), capacity }
    }

    /// Register interest in the given subtypes. At most one waiter exists
    /// per link; registering replaces any previous waiter (its receiver
    /// then yields nothing further).
    pub fn register_waiter(
        &self,
        subtypes: Vec<ManagementSubtype>,
        predicate: FramePredicate,
    ) -> FrameWaiter {
        let (sender, receiver) = mpsc::channel(4);
        let mut inner = self.inner.lock().expect("router lock poisoned");
        inner.next_waiter_id += 1;
        let id = inner.next_waiter_id;
        inner.waiter = Some(Waiter { id, subtypes, predicate, sender });
        FrameWaiter { id, receiver, inner: Arc::clone(&self.inner) }
    }

    /// Route one decoded management frame. Returns true if a waiter
    /// claimed it, false if it was queued as an indication.
    pub fn process(&self, frame: ManagementFrame) -> bool {
        let mut inner = self.inner.lock().expect("router lock poisoned");
        let frame = {
            match &inner.waiter {
                Some(waiter) if waiter.matches(&frame) => {
                    match waiter.sender.try_send(frame) {
                        Ok(()) => return true,
                        // Receiver gone or full; fall through to the queue.
                        Err(error) => error.into_inner(),
                    }
                }
                _ => frame,
            }
        };
        Self::queue(&mut inner, frame, self.capacity)
    }

    fn queue(inner: &mut RouterInner, frame: ManagementFrame, capacity: usize) -> bool {
        if inner.pending.len() >= capacity {
            inner.pending.pop_front();
            inner.dropped += 1;
            log::warn!("indication queue full, dropped oldest management frame");
        }
        inner.pending.push_back(frame);
        false
    }

    /// Claim the oldest queued indication, if any. Each frame is returned
    /// to at most one caller.
    pub fn take_indication(&self) -> Option<ManagementFrame> {
        self.inner.lock().expect("router lock poisoned").pending.pop_front()
    }

    /// Number of indications dropped to the overflow policy
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("router lock poisoned").dropped
    }

    /// Discard queued indications (used when the BSS changes)
    pub fn clear(&self) {
        self.inner.lock().expect("router lock poisoned").pending.clear();
    }
}

/// Receiving half handed to a join step waiting for a matching frame
pub struct FrameWaiter {
    id: u64,
    receiver: mpsc::Receiver<ManagementFrame>,
    inner: Arc<Mutex<RouterInner>>,
}

impl FrameWaiter {
    /// Wait up to `timeout` for a matching frame.
    pub async fn recv(&mut self, timeout: Duration) -> Option<ManagementFrame> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(frame) => frame,
            Err(_) => None,
        }
    }
}

impl Drop for FrameWaiter {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().expect("router lock poisoned");
        if inner.waiter.as_ref().map(|waiter| waiter.id) == Some(self.id) {
            inner.waiter = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{
        FrameControl, MacHeader, ManagementBody, SequenceControl,
    };
    use crate::wire::SUBTYPE_DEAUTHENTICATION;

    fn deauth_frame(sequence: u16) -> ManagementFrame {
        ManagementFrame {
            header: MacHeader {
                frame_control: FrameControl::management(SUBTYPE_DEAUTHENTICATION),
                duration: 0,
                addr1: [1; 6],
                addr2: [2; 6],
                addr3: [2; 6],
                sequence_control: SequenceControl::new(sequence),
            },
            subtype: ManagementSubtype::Deauthentication,
            body: ManagementBody::Deauthentication { reason: 1 },
        }
    }

    #[tokio::test]
    async fn test_waiter_receives_matching_frame() {
        let router = ManagementFrameRouter::new(4);
        let mut waiter = router.register_waiter(
            vec![ManagementSubtype::Deauthentication],
            Box::new(|_| true),
        );
        assert!(router.process(deauth_frame(1)));
        let frame = waiter.recv(Duration::from_millis(100)).await.unwrap();
        assert_eq!(frame.subtype, ManagementSubtype::Deauthentication);
    }

    #[tokio::test]
    async fn test_non_matching_frame_is_queued() {
        let router = ManagementFrameRouter::new(4);
        let mut waiter = router
            .register_waiter(vec![ManagementSubtype::Beacon], Box::new(|_| true));
        assert!(!router.process(deauth_frame(1)));
        assert!(waiter.recv(Duration::from_millis(10)).await.is_none());
        assert!(router.take_indication().is_some());
        assert!(router.take_indication().is_none());
    }

    #[tokio::test]
    async fn test_predicate_filters_frames() {
        let router = ManagementFrameRouter::new(4);
        let mut waiter = router.register_waiter(
            vec![ManagementSubtype::Deauthentication],
            Box::new(|frame| frame.header.sequence_control.sequence == 7),
        );
        assert!(!router.process(deauth_frame(1)));
        assert!(router.process(deauth_frame(7)));
        let frame = waiter.recv(Duration::from_millis(100)).await.unwrap();
        assert_eq!(frame.header.sequence_control.sequence, 7);
    }

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        let router = ManagementFrameRouter::new(2);
        router.process(deauth_frame(1));
        router.process(deauth_frame(2));
        router.process(deauth_frame(3));
        assert_eq!(router.dropped(), 1);
        let first = router.take_indication().unwrap();
        assert_eq!(first.header.sequence_control.sequence, 2);
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let router = ManagementFrameRouter::new(4);
        let mut waiter = router
            .register_waiter(vec![ManagementSubtype::Beacon], Box::new(|_| true));
        assert!(waiter.recv(Duration::from_millis(10)).await.is_none());
    }

    #[test]
    fn test_dropping_waiter_deregisters_it() {
        let router = ManagementFrameRouter::new(4);
        let waiter = router
            .register_waiter(vec![ManagementSubtype::Deauthentication], Box::new(|_| true));
        drop(waiter);
        // With no waiter the frame lands in the indication queue.
        assert!(!router.process(deauth_frame(1)));
        assert!(router.take_indication().is_some());
    }
}
