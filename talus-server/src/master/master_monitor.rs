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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared view of the master's role. Background workers consult it to
/// decide whether to do work and when to exit.
#[derive(Clone)]
pub struct MasterMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    active: AtomicBool,
    stopped: AtomicBool,
}

impl MasterMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                active: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.inner.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stop(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl Default for MasterMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_transitions() {
        let monitor = MasterMonitor::new();
        assert!(!monitor.is_active());
        assert!(!monitor.is_stop());

        monitor.set_active(true);
        assert!(monitor.is_active());

        monitor.stop();
        assert!(monitor.is_stop());
    }
}
