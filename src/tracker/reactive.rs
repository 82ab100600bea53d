use tokio::sync::watch;

/// A shared record whose writes are observable.
///
/// Reads and writes go through closures so callers never hold a reference
/// across a write; every write bumps the version seen by subscribers.
pub struct Reactive<T> {
    sender: watch::Sender<T>,
}

impl<T> Reactive<T> {
    pub fn new(value: T) -> Self {
        let (sender, _) = watch::channel(value);
        Self { sender }
    }

    pub fn get<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        read(&self.sender.borrow())
    }

    pub fn set(&self, write: impl FnOnce(&mut T)) {
        self.sender.send_modify(write);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T: Clone> Reactive<T> {
    pub fn snapshot(&self) -> T {
        self.sender.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_writes() {
        let record = Reactive::new(vec![1u32]);
        let mut rx = record.subscribe();

        record.set(|values| values.push(2));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), vec![1, 2]);

        assert_eq!(record.get(|values| values.len()), 2);
        assert_eq!(record.snapshot(), vec![1, 2]);
    }

    #[test]
    fn writes_land_without_subscribers() {
        let record = Reactive::new(String::new());
        record.set(|value| value.push_str("sid"));
        assert_eq!(record.snapshot(), "sid");
    }
}
