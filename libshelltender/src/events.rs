// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Typed observer registries. Producers own a `Notifier<T>` per event
//! kind, so the set of events a component emits is visible in its
//! type. Subscribers get a `Subscription` guard that unsubscribes on
//! drop, which keeps teardown automatic on scope exit.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Notifier<T> {
    subscribers: Arc<Mutex<Vec<(u64, Callback<T>)>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Notifier {
            subscribers: Arc::clone(&self.subscribers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Notifier<T> {
    pub fn new() -> Self {
        Notifier {
            subscribers: Arc::new(Mutex::new(vec![])),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a callback, returning a guard that removes it again
    /// when dropped. Call `Subscription::forever` to keep the
    /// callback registered for the life of the notifier.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription
    where
        T: Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // we unwrap to propagate the poison as an unwind
        self.subscribers.lock().unwrap().push((id, Arc::new(callback)));

        Subscription { id, subscribers: SubscriberSlot::new(Arc::downgrade(&self.subscribers)) }
    }

    /// Deliver an event to every current subscriber, in subscription
    /// order. The subscriber list is snapshotted before delivery so
    /// membership churn never deadlocks against a callback that
    /// subscribes or unsubscribes.
    pub fn emit(&self, event: &T) {
        let callbacks: Vec<Callback<T>> =
            self.subscribers.lock().unwrap().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

/// RAII handle for one subscription.
pub struct Subscription {
    id: u64,
    subscribers: SubscriberSlot,
}

impl Subscription {
    /// Keep the callback registered for the lifetime of the notifier
    /// instead of tying it to this guard's scope.
    pub fn forever(mut self) {
        self.subscribers = SubscriberSlot::Detached;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.remove(self.id);
    }
}

/// Type-erased backref to the subscriber list so `Subscription` does
/// not need the event type parameter.
enum SubscriberSlot {
    Attached(Box<dyn Fn(u64) + Send + Sync>),
    Detached,
}

impl SubscriberSlot {
    fn new<T: 'static>(subscribers: Weak<Mutex<Vec<(u64, Callback<T>)>>>) -> Self
    where
        T: Send + Sync,
    {
        SubscriberSlot::Attached(Box::new(move |id| {
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.lock().unwrap().retain(|(sub_id, _)| *sub_id != id);
            }
        }))
    }

    fn remove(&self, id: u64) {
        if let SubscriberSlot::Attached(remove) = self {
            remove(id);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn emit_reaches_all_subscribers() {
        let notifier: Notifier<u32> = Notifier::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let _s1 = notifier.subscribe(move |v| {
            c1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        let _s2 = notifier.subscribe(move |v| {
            c2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        notifier.emit(&3);
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn drop_unsubscribes() {
        let notifier: Notifier<()> = Notifier::new();
        let count = Arc::new(AtomicUsize::new(0));

        {
            let c = Arc::clone(&count);
            let _sub = notifier.subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
            notifier.emit(&());
        }
        notifier.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.len(), 0);
    }

    #[test]
    fn forever_outlives_scope() {
        let notifier: Notifier<()> = Notifier::new();
        let count = Arc::new(AtomicUsize::new(0));

        {
            let c = Arc::clone(&count);
            notifier
                .subscribe(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .forever();
        }
        notifier.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_from_within_callback_does_not_deadlock() {
        let notifier: Notifier<()> = Notifier::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot_in_cb = Arc::clone(&slot);
        let sub = notifier.subscribe(move |_| {
            // dropping the guard re-enters the subscriber list
            let _ = slot_in_cb.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        notifier.emit(&());
        notifier.emit(&());
        assert_eq!(notifier.len(), 0);
    }
}
