// Copyright 2025 OPPO.
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

use log::{error, info, warn};
use std::thread::JoinHandle;
use std::time::Duration;

/// A periodic background task. `run` is invoked once per interval until
/// `terminate` returns true.
pub trait LoopTask: Send + 'static {
    type Error: std::fmt::Display;

    fn run(&self) -> Result<(), Self::Error>;

    fn terminate(&self) -> bool;
}

/// Aborts the process if the owning thread unwinds. Created inside workers
/// the system cannot run without.
pub struct AbortOnPanic(pub &'static str);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("{} thread panicked, terminating", self.0);
            std::process::abort();
        }
    }
}

/// Drives a [`LoopTask`] on a dedicated thread.
pub struct LoopRunner {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl LoopRunner {
    pub fn spawn<T: LoopTask>(name: &str, interval: Duration, task: T) -> Self {
        Self::spawn_inner(name, interval, task, false)
    }

    /// Like [`LoopRunner::spawn`], but a panic in the task aborts the
    /// whole process instead of silently killing the thread.
    pub fn spawn_critical<T: LoopTask>(name: &str, interval: Duration, task: T) -> Self {
        Self::spawn_inner(name, interval, task, true)
    }

    fn spawn_inner<T: LoopTask>(name: &str, interval: Duration, task: T, critical: bool) -> Self {
        let thread_name = name.to_string();
        let log_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let _guard = critical.then(|| AbortOnPanic("critical loop task"));
                loop {
                    if task.terminate() {
                        info!("{} stopped", log_name);
                        break;
                    }
                    if let Err(e) = task.run() {
                        warn!("{} iteration failed: {}", log_name, e);
                    }
                    Self::sleep_interruptible(&task, interval);
                }
            })
            .expect("failed to spawn loop task thread");

        Self {
            name: name.to_string(),
            handle: Some(handle),
        }
    }

    /// Sleep the interval in short steps so shutdown is observed within
    /// a bounded grace period even for long ticks.
    fn sleep_interruptible<T: LoopTask>(task: &T, interval: Duration) {
        let step = Duration::from_millis(100);
        let mut remaining = interval;
        while !task.terminate() && remaining > Duration::ZERO {
            let next = remaining.min(step);
            std::thread::sleep(next);
            remaining -= next;
        }
    }

    /// Waits for the task thread to observe `terminate` and exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} exited abnormally", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountTask {
        runs: Arc<AtomicU32>,
        stop: Arc<AtomicBool>,
    }

    impl LoopTask for CountTask {
        type Error = String;

        fn run(&self) -> Result<(), String> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            if n >= 2 {
                self.stop.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        fn terminate(&self) -> bool {
            self.stop.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_loop_runner_runs_until_terminated() {
        let runs = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let task = CountTask {
            runs: runs.clone(),
            stop: stop.clone(),
        };

        let mut runner = LoopRunner::spawn("count-task", Duration::from_millis(1), task);
        runner.join();
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }
}
