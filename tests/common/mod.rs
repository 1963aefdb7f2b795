//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use quorumflow::runtime::registry::ActivityHandler;

/// What a [`CountingActivity`] does on each invocation.
#[derive(Clone)]
pub enum Behavior {
    /// Succeed every time with this result.
    AlwaysOk(String),
    /// Fail every time with this error.
    AlwaysErr(String),
    /// Fail until the given attempt number, then succeed.
    SucceedOnAttempt(u32, String),
}

/// Activity handler that counts invocations and follows a scripted behavior.
pub struct CountingActivity {
    pub calls: Arc<AtomicU32>,
    behavior: Behavior,
}

impl CountingActivity {
    pub fn new(behavior: Behavior) -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Self {
                calls: calls.clone(),
                behavior,
            }),
            calls,
        )
    }
}

#[async_trait]
impl ActivityHandler for CountingActivity {
    async fn invoke(&self, _input: String) -> Result<String, String> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.behavior {
            Behavior::AlwaysOk(result) => Ok(result.clone()),
            Behavior::AlwaysErr(error) => Err(error.clone()),
            Behavior::SucceedOnAttempt(n, result) => {
                if attempt >= *n {
                    Ok(result.clone())
                } else {
                    Err(format!("scripted failure on attempt {attempt}"))
                }
            }
        }
    }
}
