// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Raw frame I/O as seen by an agent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::errors::LldpdError;
use crate::types::LldpdResult;

/// Link state notifications, delivered to `Agent::link_event()` by whoever
/// is monitoring the underlying port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down,
    MtuChanged(usize),
    FlowControlChanged,
}

/// A link on which complete Ethernet frames can be sent and received.
pub trait Transport: Send + Sync {
    /// Send a single frame, including its Ethernet header
    fn send(&self, frame: &[u8]) -> LldpdResult<()>;

    /// Wait up to `timeout` for the next inbound frame.  Returns `Ok(None)`
    /// if nothing arrived in time.  Once the transport has been closed every
    /// call returns an error without blocking.
    fn recv(&self, timeout: Duration) -> LldpdResult<Option<Vec<u8>>>;

    /// Release the link.  Blocked receivers are woken.
    fn close(&self);
}

#[derive(Default)]
struct PortQueue {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

struct SegmentPortInner {
    id: usize,
    queue: Mutex<PortQueue>,
    cv: Condvar,
}

#[derive(Default)]
struct SegmentInner {
    next_id: usize,
    ports: Vec<Arc<SegmentPortInner>>,
}

/// An in-process broadcast medium.  Every frame sent on one attached port is
/// delivered to every other open port.
#[derive(Clone, Default)]
pub struct Segment {
    inner: Arc<Mutex<SegmentInner>>,
}

/// How many frames a port will buffer before dropping new arrivals
const PORT_QUEUE_DEPTH: usize = 256;

impl Segment {
    pub fn new() -> Self {
        Segment::default()
    }

    pub fn attach(&self) -> SegmentPort {
        let mut inner = self.inner.lock().unwrap();
        let port = Arc::new(SegmentPortInner {
            id: inner.next_id,
            queue: Mutex::new(PortQueue::default()),
            cv: Condvar::new(),
        });
        inner.next_id += 1;
        inner.ports.push(port.clone());
        SegmentPort {
            segment: self.inner.clone(),
            port,
        }
    }

    /// A point-to-point link: a new segment with exactly two ports
    pub fn pair() -> (SegmentPort, SegmentPort) {
        let segment = Segment::new();
        (segment.attach(), segment.attach())
    }
}

pub struct SegmentPort {
    segment: Arc<Mutex<SegmentInner>>,
    port: Arc<SegmentPortInner>,
}

impl Transport for SegmentPort {
    fn send(&self, frame: &[u8]) -> LldpdResult<()> {
        if self.port.queue.lock().unwrap().closed {
            return Err(LldpdError::Transport("port is closed".into()));
        }
        let peers: Vec<Arc<SegmentPortInner>> = self
            .segment
            .lock()
            .unwrap()
            .ports
            .iter()
            .filter(|p| p.id != self.port.id)
            .cloned()
            .collect();

        for peer in peers {
            let mut queue = peer.queue.lock().unwrap();
            if !queue.closed && queue.frames.len() < PORT_QUEUE_DEPTH {
                queue.frames.push_back(frame.to_vec());
                peer.cv.notify_all();
            }
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> LldpdResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.port.queue.lock().unwrap();
        loop {
            if queue.closed {
                return Err(LldpdError::Transport("port is closed".into()));
            }
            if let Some(frame) = queue.frames.pop_front() {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            queue = self.port.cv.wait_timeout(queue, deadline - now).unwrap().0;
        }
    }

    fn close(&self) {
        let mut queue = self.port.queue.lock().unwrap();
        queue.closed = true;
        queue.frames.clear();
        self.port.cv.notify_all();
        drop(queue);
        self.segment
            .lock()
            .unwrap()
            .ports
            .retain(|p| p.id != self.port.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_pair_delivery() {
        let (a, b) = Segment::pair();
        a.send(&[1, 2, 3]).unwrap();
        assert_eq!(b.recv(SHORT).unwrap(), Some(vec![1, 2, 3]));
        // no echo back to the sender
        assert_eq!(a.recv(SHORT).unwrap(), None);
    }

    #[test]
    fn test_broadcast_to_every_other_port() {
        let segment = Segment::new();
        let ports: Vec<SegmentPort> = (0..3).map(|_| segment.attach()).collect();
        ports[1].send(&[9]).unwrap();
        assert_eq!(ports[0].recv(SHORT).unwrap(), Some(vec![9]));
        assert_eq!(ports[2].recv(SHORT).unwrap(), Some(vec![9]));
        assert_eq!(ports[1].recv(SHORT).unwrap(), None);
    }

    #[test]
    fn test_close_wakes_receiver() {
        let (a, b) = Segment::pair();
        let b = Arc::new(b);
        let receiver = b.clone();
        let handle = std::thread::spawn(move || {
            receiver.recv(Duration::from_secs(10))
        });
        std::thread::sleep(SHORT);
        b.close();
        assert!(handle.join().unwrap().is_err());
        assert!(b.send(&[0]).is_err());
        // the surviving port can still send into the void
        assert!(a.send(&[0]).is_ok());
    }
}
