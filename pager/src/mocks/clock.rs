use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// A manually advanced [crate::Clock], starting at [SystemTime::UNIX_EPOCH].
///
/// Clones share the same time.
#[derive(Clone)]
pub struct Clock {
    now: Arc<Mutex<SystemTime>>,
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            now: Arc::new(Mutex::new(SystemTime::UNIX_EPOCH)),
        }
    }
}

impl Clock {
    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }
}

impl crate::Clock for Clock {
    fn current(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}
