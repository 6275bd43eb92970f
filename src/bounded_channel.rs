// SPDX-License-Identifier: Apache-2.0

//! Thin wrapper over flume bounded channels. Keeps call sites insulated from
//! the channel crate and narrows the surface to what the dispatch loop and
//! workers actually use.

use flume::{Receiver, Sender};
use std::fmt;
use std::time::Duration;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl<T> BoundedSender<T> {
    /// Blocks until there is capacity in the channel.
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        self.tx.send(item).map_err(|_| SendError::Disconnected)
    }

    /// Non-blocking send; fails on a full or closed channel.
    pub fn try_send(&self, item: T) -> Result<(), SendError> {
        self.tx.try_send(item).map_err(|_| SendError::Disconnected)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Blocks until an item is available; `None` once all senders are gone.
    pub fn recv_blocking(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Returns immediately; `None` when empty or disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocks until an item arrives or the timeout expires.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);
    (BoundedSender { tx }, BoundedReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_receive() {
        let (tx, rx) = bounded(2);
        tx.send_blocking(1).unwrap();
        tx.send_blocking(2).unwrap();
        assert_eq!(rx.recv_blocking(), Some(1));
        assert_eq!(rx.try_recv(), Some(2));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn receiver_sees_disconnect() {
        let (tx, rx) = bounded::<u32>(1);
        drop(tx);
        assert_eq!(rx.recv_blocking(), None);
    }

    #[test]
    fn recv_timeout_expires() {
        let (_tx, rx) = bounded::<u32>(1);
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), None);
    }
}
