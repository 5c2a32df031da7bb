// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of duelrank.
//
// duelrank is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// duelrank is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with duelrank.  If not,
// see <http://www.gnu.org/licenses/>.

//! # lifecycle management
//!
//! duelrank shuts down in two phases: a *graceful* broadcast that lets services finish in-flight
//! work (the vote processor drains its queue), then a *forceful* one that tells stragglers to
//! abort. Each phase is a [Manager]: a broadcastable cancellation signal plus a wait-group of
//! named service handles.
//!
//! A [Handle] is what a background service actually holds: it can ask "am I cancelled?", await
//! cancellation in a `select!`, and — most used — [sleep](Handle::sleep) cancellably. Every retry
//! loop in the crate sleeps through its handle, which is what makes 2-second backoff loops exit
//! promptly at shutdown. Dropping a handle is how a service reports completion; the wait-group is
//! the sender-drop idiom (the manager holds the sole receiver and `recv()` resolves `None` once
//! every handle is gone).

use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use snafu::Snafu;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::info;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A service named {name} is already registered"))]
    Duplicate { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returned by [Handle::sleep] when the sleep was cut short by cancellation
#[derive(Debug, Snafu)]
#[snafu(display("cancelled"))]
pub struct Cancelled;

pub struct Manager {
    cancel: watch::Sender<bool>,
    services: Arc<StdMutex<HashSet<String>>>,
    /// Cloned into every handle; dropped when `wait_with_timeout` runs so the receiver can drain
    tracker_tx: StdMutex<Option<mpsc::Sender<()>>>,
    tracker_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

/// A named service's grip on its lifecycle
pub struct Handle {
    name: String,
    cancelled: watch::Receiver<bool>,
    services: Arc<StdMutex<HashSet<String>>>,
    _tracker: mpsc::Sender<()>,
}

impl Manager {
    pub fn new() -> Manager {
        let (cancel, _) = watch::channel(false);
        let (tracker_tx, tracker_rx) = mpsc::channel(1);
        Manager {
            cancel,
            services: Arc::new(StdMutex::new(HashSet::new())),
            tracker_tx: StdMutex::new(Some(tracker_tx)),
            tracker_rx: Mutex::new(Some(tracker_rx)),
        }
    }

    /// Register a service & hand back its handle
    pub fn handle(&self, name: &str) -> Result<Handle> {
        let mut services = self.services.lock().expect("lock poisoned");
        if !services.insert(name.to_owned()) {
            return DuplicateSnafu { name }.fail();
        }
        info!("lifecycle: service [{}] registered", name);
        let tracker = self
            .tracker_tx
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .expect("handles must be created before wait_with_timeout")
            .clone();
        Ok(Handle {
            name: name.to_owned(),
            cancelled: self.cancel.subscribe(),
            services: self.services.clone(),
            _tracker: tracker,
        })
    }

    /// Broadcast cancellation to every handle
    pub fn shutdown(&self) {
        info!("lifecycle: broadcasting shutdown");
        let _ = self.cancel.send(true);
    }

    /// Wait up to `timeout` for every handle to drop; returns the names of stragglers
    pub async fn wait_with_timeout(&self, timeout: Duration) -> Vec<String> {
        // Drop our own sender so the channel closes once the last handle is gone.
        drop(self.tracker_tx.lock().expect("lock poisoned").take());
        let mut rx = match self.tracker_rx.lock().await.take() {
            Some(rx) => rx,
            // A second wait; everything already settled or it didn't — report what's left.
            None => {
                return self.services.lock().expect("lock poisoned").iter().cloned().collect()
            }
        };
        let _ = tokio::time::timeout(timeout, async {
            // Handles never send; recv resolves only when every sender is dropped.
            rx.recv().await
        })
        .await;
        self.services.lock().expect("lock poisoned").iter().cloned().collect()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new()
    }
}

impl Handle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolve when the manager broadcasts shutdown (immediately if it already has)
    pub async fn done(&self) {
        let mut rx = self.cancelled.clone();
        if *rx.borrow() {
            return;
        }
        // Err means the manager is gone, which is as final as cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `duration`, returning early with `Err(Cancelled)` on shutdown
    pub async fn sleep(&self, duration: Duration) -> std::result::Result<(), Cancelled> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.done() => Err(Cancelled),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.services.lock().expect("lock poisoned").remove(&self.name);
        info!("lifecycle: service [{}] closed", self.name);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let manager = Manager::new();
        let _a = manager.handle("worker").unwrap();
        assert!(manager.handle("worker").is_err());
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_shutdown() {
        let manager = Arc::new(Manager::new());
        let handle = manager.handle("sleeper").unwrap();
        let waker = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.shutdown();
        });
        let start = std::time::Instant::now();
        assert!(handle.sleep(Duration::from_secs(60)).await.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn wait_reports_stragglers() {
        let manager = Manager::new();
        let prompt = manager.handle("prompt").unwrap();
        let straggler = manager.handle("straggler").unwrap();
        manager.shutdown();
        drop(prompt);
        let remaining = manager.wait_with_timeout(Duration::from_millis(50)).await;
        assert_eq!(remaining, vec!["straggler".to_owned()]);
        drop(straggler);
    }

    #[tokio::test]
    async fn wait_resolves_once_all_handles_drop() {
        let manager = Arc::new(Manager::new());
        let handle = manager.handle("worker").unwrap();
        let worker = tokio::spawn(async move {
            handle.done().await;
        });
        manager.shutdown();
        worker.await.unwrap();
        let remaining = manager.wait_with_timeout(Duration::from_secs(5)).await;
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_visible_to_late_subscribers() {
        let manager = Manager::new();
        manager.shutdown();
        let handle = manager.handle("late").unwrap();
        handle.done().await; // must not hang
        assert!(handle.is_cancelled());
    }
}
