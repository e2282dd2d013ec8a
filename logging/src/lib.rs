//! Typed, buffering event loggers behind a named registry.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A map from names to typed loggers, sharing one time origin.
pub struct Registry {
    /// An instant common to all logging statements.
    time: Instant,
    /// A map from names to typed loggers.
    map: HashMap<String, Entry>,
}

struct Entry {
    logger: Box<dyn Any>,
    flush: Box<dyn Fn()>,
}

impl Registry {
    /// Binds a log name to an action on log event batches.
    ///
    /// Any pre-installed logger for the name is returned rather than
    /// silently discarded. Loggers acquired before the call keep writing to
    /// the old destination; loggers acquired after it use the new one.
    pub fn insert<T: 'static>(
        &mut self,
        name: &str,
        action: impl Fn(&Duration, &[(Duration, T)]) + 'static,
    ) -> Option<Box<dyn Any>> {
        let logger = Logger::<T>::new(self.time, Box::new(action));
        let flusher = logger.clone();
        let entry = Entry {
            logger: Box::new(logger),
            flush: Box::new(move || flusher.flush()),
        };
        self.map.insert(name.to_owned(), entry).map(|e| e.logger)
    }

    /// Removes a bound logger, closing its stream once all handles drop.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Any>> {
        self.map.remove(name).map(|e| e.logger)
    }

    /// Retrieves a shared logger, if one has been inserted.
    pub fn get<T: 'static>(&self, name: &str) -> Option<Logger<T>> {
        self.map
            .get(name)
            .and_then(|entry| entry.logger.downcast_ref::<Logger<T>>())
            .cloned()
    }

    /// Creates a new logger registry anchored at `time`.
    pub fn new(time: Instant) -> Self {
        Registry {
            time,
            map: HashMap::new(),
        }
    }

    /// Flushes every installed logger.
    pub fn flush(&mut self) {
        for entry in self.map.values() {
            (entry.flush)();
        }
    }
}

type Action<T> = Box<dyn Fn(&Duration, &[(Duration, T)])>;

/// A buffering logger.
pub struct Logger<T> {
    time: Instant,                           // common instant used for all loggers.
    action: Rc<Action<T>>,                   // action to take on full log buffers.
    buffer: Rc<RefCell<Vec<(Duration, T)>>>, // shared buffer of pending events.
}

impl<T> Clone for Logger<T> {
    fn clone(&self) -> Self {
        Logger {
            time: self.time,
            action: Rc::clone(&self.action),
            buffer: Rc::clone(&self.buffer),
        }
    }
}

impl<T> Logger<T> {
    /// Allocates a new shareable logger bound to a write destination.
    pub fn new(time: Instant, action: Action<T>) -> Self {
        Logger {
            time,
            action: Rc::new(action),
            buffer: Rc::new(RefCell::new(Vec::with_capacity(1024))),
        }
    }

    /// Logs an event.
    ///
    /// The event has its timestamp recorded at the moment of logging, but it
    /// may be delayed due to buffering. It will be written when the logger
    /// is next flushed, either because the buffer reached capacity or by a
    /// direct call to [`Logger::flush`].
    pub fn log(&self, event: T) {
        let mut buffer = self.buffer.borrow_mut();
        buffer.push((self.time.elapsed(), event));
        if buffer.len() == buffer.capacity() {
            (self.action)(&self.time.elapsed(), &buffer[..]);
            buffer.clear();
        }
    }

    /// Flushes logged messages and communicates the new minimal timestamp.
    pub fn flush(&self) {
        let mut buffer = self.buffer.borrow_mut();
        (self.action)(&self.time.elapsed(), &buffer[..]);
        buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn logged_events_arrive_on_flush() {
        let (send, recv) = mpsc::channel();
        let mut registry = Registry::new(Instant::now());
        registry.insert::<u32>("apm", move |_, batch| {
            for (_, event) in batch {
                send.send(*event).unwrap();
            }
        });

        let logger = registry.get::<u32>("apm").unwrap();
        logger.log(3);
        logger.log(5);
        assert!(recv.try_recv().is_err());

        registry.flush();
        assert_eq!(recv.try_recv(), Ok(3));
        assert_eq!(recv.try_recv(), Ok(5));
    }

    #[test]
    fn typed_lookup_is_checked() {
        let mut registry = Registry::new(Instant::now());
        registry.insert::<u32>("apm", |_, _| {});
        assert!(registry.get::<u64>("apm").is_none());
        assert!(registry.get::<u32>("apm").is_some());
        assert!(registry.get::<u32>("other").is_none());
    }
}
