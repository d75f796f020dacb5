use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, unbounded};

/// Sends messages from a single source to all current subscribers.
pub struct MsgDispatcher<T: Send + Sync + Clone + 'static> {
    source: Receiver<T>,
    receivers: Arc<Mutex<Vec<Sender<T>>>>,
    shutdown_sender: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl<T: Send + Sync + Clone + 'static> MsgDispatcher<T> {
    /// Creates a dispatcher that relays everything received on `source`.
    pub fn new(source: Receiver<T>) -> Self {
        Self {
            source,
            receivers: Arc::new(Mutex::new(Vec::new())),
            shutdown_sender: None,
            thread_handle: None,
        }
    }

    /// Registers a new subscriber and returns its receiving end.
    pub fn subscribe(&self) -> Receiver<T> {
        let (sender, receiver) = unbounded();
        self.receivers.lock().unwrap().push(sender);
        receiver
    }

    /// Starts the background fan-out thread.
    pub fn start(&mut self) {
        let source = self.source.clone();
        let receivers = Arc::clone(&self.receivers);
        let (shutdown_sender, shutdown_receiver) = unbounded();
        self.shutdown_sender = Some(shutdown_sender);

        self.thread_handle = Some(thread::spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(source) -> msg => {
                        match msg {
                            Ok(value) => {
                                let mut lock = receivers.lock().unwrap();
                                lock.retain(|sender| sender.send(value.clone()).is_ok());
                            }
                            Err(_) => break,
                        }
                    }
                    recv(shutdown_receiver) -> _ => break,
                }
            }
        }));
    }

    /// Signals shutdown and joins the fan-out thread.
    pub fn stop(&mut self) {
        if let Some(sender) = self.shutdown_sender.take() {
            let _ = sender.send(());
        }

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl<T: Send + Sync + Clone + 'static> Drop for MsgDispatcher<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fans_out_to_all_subscribers() {
        let (tx, rx) = unbounded::<u32>();
        let mut dispatcher = MsgDispatcher::new(rx);
        let a = dispatcher.subscribe();
        let b = dispatcher.subscribe();
        dispatcher.start();

        tx.send(42).unwrap();

        assert_eq!(a.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
        assert_eq!(b.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    }

    #[test]
    fn drops_closed_subscribers() {
        let (tx, rx) = unbounded::<u32>();
        let mut dispatcher = MsgDispatcher::new(rx);
        {
            let _dropped = dispatcher.subscribe();
        }
        let kept = dispatcher.subscribe();
        dispatcher.start();

        tx.send(1).unwrap();
        assert_eq!(kept.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
    }
}
