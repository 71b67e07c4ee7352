//! Idle detection.
//!
//! Watches the request rate through a smoothed per-second window and
//! declares the system idle once the rate stays below the threshold for
//! the configured duration. Registered consumers get `IdleStart`,
//! an `IdleTick` every second while idle, and `IdleEnd` on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bds_api_types::IdleDetectorConfig;

use bds_tools::timed_average::TimedAverage;

use crate::error::{DedupError, Result};

pub trait IdleConsumer: Send + Sync {
    fn on_idle_start(&self) {}
    fn on_idle_tick(&self) {}
    fn on_idle_end(&self) {}
}

struct IdleInner {
    config: IdleDetectorConfig,
    window: Mutex<TimedAverage>,
    consumers: RwLock<Vec<(String, Arc<dyn IdleConsumer>)>>,
    idle: AtomicBool,
    below_since: Mutex<Option<Instant>>,
    stop: AtomicBool,
}

pub struct IdleDetector {
    inner: Arc<IdleInner>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl IdleDetector {
    pub fn new(config: &IdleDetectorConfig) -> Self {
        Self {
            inner: Arc::new(IdleInner {
                config: config.clone(),
                window: Mutex::new(TimedAverage::new(Duration::from_secs(10))),
                consumers: RwLock::new(Vec::new()),
                idle: AtomicBool::new(false),
                below_since: Mutex::new(None),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Register a consumer by unique name; allowed after `run`.
    pub fn register<S: Into<String>>(&self, name: S, consumer: Arc<dyn IdleConsumer>) {
        self.inner.consumers.write().unwrap().push((name.into(), consumer));
    }

    /// Called by the request pipeline for every request.
    pub fn note_request(&self) {
        self.inner.window.lock().unwrap().add(1);
        if self.inner.idle.load(Ordering::Acquire) {
            // a request ends the idle period immediately
            self.inner.idle.store(false, Ordering::Release);
            *self.inner.below_since.lock().unwrap() = None;
            for (_name, consumer) in self.inner.consumers.read().unwrap().iter() {
                consumer.on_idle_end();
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.inner.idle.load(Ordering::Acquire)
    }

    fn evaluate(inner: &Arc<IdleInner>) {
        let rate = inner.window.lock().unwrap().rate_per_second();
        let was_idle = inner.idle.load(Ordering::Acquire);

        if rate < inner.config.idle_throughput {
            let mut below_since = inner.below_since.lock().unwrap();
            let since = below_since.get_or_insert_with(Instant::now);
            let long_enough =
                since.elapsed() >= Duration::from_secs(inner.config.idle_duration_secs);
            drop(below_since);

            if long_enough && !was_idle {
                inner.idle.store(true, Ordering::Release);
                for (_name, consumer) in inner.consumers.read().unwrap().iter() {
                    consumer.on_idle_start();
                }
            }
            if inner.idle.load(Ordering::Acquire) {
                for (_name, consumer) in inner.consumers.read().unwrap().iter() {
                    consumer.on_idle_tick();
                }
            }
        } else {
            *inner.below_since.lock().unwrap() = None;
            if was_idle {
                inner.idle.store(false, Ordering::Release);
                for (_name, consumer) in inner.consumers.read().unwrap().iter() {
                    consumer.on_idle_end();
                }
            }
        }
    }

    pub fn run(&self) {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("idle-detector".into())
            .spawn(move || {
                while !inner.stop.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_secs(1));
                    if inner.stop.load(Ordering::Acquire) {
                        break;
                    }
                    Self::evaluate(&inner);
                }
            })
            .unwrap();
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle
                .join()
                .map_err(|_| DedupError::programming("idle detector thread panicked"))?;
        }
        Ok(())
    }

    /// Force one evaluation round, for tests.
    #[doc(hidden)]
    pub fn tick_now(&self) {
        Self::evaluate(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        starts: AtomicUsize,
        ticks: AtomicUsize,
        ends: AtomicUsize,
    }

    impl IdleConsumer for Recorder {
        fn on_idle_start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_idle_tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
        fn on_idle_end(&self) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> IdleDetectorConfig {
        IdleDetectorConfig {
            idle_throughput: 1000.0,
            idle_duration_secs: 0,
        }
    }

    #[test]
    fn idle_start_and_tick() {
        let detector = IdleDetector::new(&config());
        let recorder = Arc::new(Recorder::default());
        detector.register("test", recorder.clone());

        detector.tick_now();
        assert!(detector.is_idle());
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.ticks.load(Ordering::SeqCst), 1);

        // further rounds tick without a second start
        detector.tick_now();
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn request_ends_idle_period() {
        let detector = IdleDetector::new(&config());
        let recorder = Arc::new(Recorder::default());
        detector.register("test", recorder.clone());

        detector.tick_now();
        assert!(detector.is_idle());
        detector.note_request();
        assert!(!detector.is_idle());
        assert_eq!(recorder.ends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_after_run_is_allowed() {
        let detector = IdleDetector::new(&config());
        detector.run();
        let recorder = Arc::new(Recorder::default());
        detector.register("late", recorder);
        detector.stop().unwrap();
    }
}
