//! Observable values
//!
//! Reactive value holder using `tokio::sync::watch` for multi-subscriber
//! notifications. The scan engine publishes its status surface (phase, current
//! point, diagnostic text, connectivity) through an [`Observable`], so hosts can
//! either poll [`Observable::get`] or await changes on a subscription.
//!
//! # Example
//!
//! ```rust,ignore
//! let progress = Observable::new("progress", 0usize);
//!
//! let mut rx = progress.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("point {}", *rx.borrow());
//!     }
//! });
//!
//! progress.set(1);
//! progress.update(|p| *p += 1);
//! ```

use std::fmt::Debug;
use tokio::sync::watch;

// =============================================================================
// Observable<T>
// =============================================================================

/// A thread-safe, observable value with change notifications.
///
/// Clones share the same underlying channel: a `set` on any clone is seen by
/// every subscriber of every clone.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Name used in logs.
    name: &'static str,
    /// The watch channel sender (holds current value)
    sender: watch::Sender<T>,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an observable holding `initial`.
    pub fn new(name: &'static str, initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { name, sender }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Modify the value in place and notify subscribers.
    pub fn update<F>(&self, modify: F)
    where
        F: FnOnce(&mut T),
    {
        self.sender.send_modify(modify);
    }

    /// Subscribe to changes. The receiver starts with the current value marked
    /// as seen.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Whether anyone is subscribed.
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Clone for Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
        }
    }
}

impl<T> Debug for Observable<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("value", &*self.sender.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_and_get() {
        let obs = Observable::new("count", 1u32);
        obs.set(5);
        assert_eq!(obs.get(), 5);
        obs.update(|v| *v += 2);
        assert_eq!(obs.get(), 7);
    }

    #[test]
    fn test_clones_share_value() {
        let a = Observable::new("shared", String::from("idle"));
        let b = a.clone();
        b.set("scanning".into());
        assert_eq!(a.get(), "scanning");
    }

    #[tokio::test]
    async fn test_subscriber_notified() {
        let obs = Observable::new("phase", 0u8);
        let mut rx = obs.subscribe();
        assert_eq!(obs.subscriber_count(), 1);

        let writer = obs.clone();
        tokio::spawn(async move {
            writer.set(3);
        });

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow(), 3);
    }
}
