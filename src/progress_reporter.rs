use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::info;

/// Background thread logging how many jobs of a stage have finished.
pub struct ProgressReporter {
    counter: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn start(stage_name: &str, total: usize, interval: Duration) -> Self {
        let counter = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let stage = stage_name.to_string();
        let (c, s) = (counter.clone(), stop.clone());
        let handle = std::thread::spawn(move || report_loop(&c, &s, total, interval, &stage));
        Self {
            counter,
            stop,
            handle,
        }
    }

    pub fn tick(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn finish(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

fn report_loop(
    counter: &AtomicUsize,
    stop: &AtomicBool,
    total: usize,
    interval: Duration,
    stage_name: &str,
) {
    let mut last_report = Instant::now();
    while counter.load(Ordering::Relaxed) < total && !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now.duration_since(last_report) >= interval {
            let progress = counter.load(Ordering::Relaxed);
            let percent = (progress as f64 / total as f64) * 100.0;
            info!(
                "stage: {}, jobs finished: {:.2}% ({}/{})",
                stage_name, percent, progress, total
            );
            last_report = now;
        }
        std::thread::sleep(Duration::from_millis(300));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_ticks_and_stops() {
        let p = ProgressReporter::start("test", 3, Duration::from_millis(10));
        p.tick();
        p.tick();
        assert_eq!(p.finished(), 2);
        p.finish();
    }
}
