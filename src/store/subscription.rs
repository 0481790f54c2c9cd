//! Live-Subscriptions
//!
//! Eine `Subscription` liefert Updates, bis sie gedroppt wird. Beim Drop
//! meldet sie sich beim Store ab.

use tokio::sync::mpsc;

pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Wartet auf das nächste Update; `None` wenn der Store die
    /// Subscription beendet hat
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Nicht-blockierend
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
