use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

/// A single cancellable timer tagged with the key it was armed for. Arming
/// with the key already held keeps the running countdown.
pub struct KeyedTimer<K> {
    armed: Option<(K, JoinHandle<()>)>,
}

impl<K> Default for KeyedTimer<K> {
    fn default() -> Self {
        Self { armed: None }
    }
}

impl<K: PartialEq> KeyedTimer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `on_expire` after `delay` unless disarmed or re-armed with a
    /// different key first. Returns whether a new countdown was started.
    pub fn arm<F>(&mut self, key: K, delay: Duration, on_expire: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.armed_key() == Some(&key) {
            return false;
        }
        self.disarm();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            on_expire.await;
        });
        self.armed = Some((key, handle));
        true
    }

    pub fn disarm(&mut self) {
        if let Some((_, handle)) = self.armed.take() {
            handle.abort();
        }
    }

    /// Disarms only the countdown armed for `key`; a stale key leaves a newer
    /// countdown running.
    pub fn disarm_if(&mut self, key: &K) -> bool {
        if self.armed_key() != Some(key) {
            return false;
        }
        self.disarm();
        true
    }

    pub fn armed_key(&self) -> Option<&K> {
        self.armed.as_ref().map(|(key, _)| key)
    }
}

impl<K> Drop for KeyedTimer<K> {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.armed.take() {
            handle.abort();
        }
    }
}
