//! Process-wide service object shared by every connection.

use crate::config::ProtocolConfig;
use crate::driver::Driver;
use crate::store::ConfigurationService;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
struct BroadcastOwner {
    ws_id: String,
    generation: u64,
}

/// Cancellation scope of one repeat or sequence command.
#[derive(Debug, Clone)]
pub struct RepeatScope {
    pub token: CancellationToken,
    generation: u64,
}

pub struct IntegrationContext {
    driver: Arc<dyn Driver>,
    configuration: Arc<dyn ConfigurationService>,
    options: ProtocolConfig,
    stop: CancellationToken,
    generation: AtomicU64,
    // base id (lowercase) -> connection whose broadcast covers it
    broadcasting: Arc<DashMap<String, BroadcastOwner>>,
    repeat_commands: DashMap<String, RepeatScope>,
    sensor_suffixes: DashMap<String, BTreeSet<String>>,
    select_suffixes: DashMap<String, BTreeSet<String>>,
}

impl IntegrationContext {
    pub fn new(
        driver: Arc<dyn Driver>,
        configuration: Arc<dyn ConfigurationService>,
        options: ProtocolConfig,
        stop: CancellationToken,
    ) -> Self {
        Self {
            driver,
            configuration,
            options,
            stop,
            generation: AtomicU64::new(1),
            broadcasting: Arc::new(DashMap::new()),
            repeat_commands: DashMap::new(),
            sensor_suffixes: DashMap::new(),
            select_suffixes: DashMap::new(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn configuration(&self) -> &Arc<dyn ConfigurationService> {
        &self.configuration
    }

    pub fn options(&self) -> &ProtocolConfig {
        &self.options
    }

    /// Fires on process shutdown; every connection scope descends from it.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Records that a broadcast started on `ws_id` covers `base_ids`. The
    /// records disappear once `token` is cancelled.
    pub fn track_broadcast(
        &self,
        ws_id: &str,
        base_ids: &[String],
        token: &CancellationToken,
    ) -> u64 {
        let generation = self.next_generation();
        self.extend_broadcast(ws_id, generation, base_ids);

        let broadcasting = Arc::clone(&self.broadcasting);
        let token = token.clone();
        let ws_id = ws_id.to_string();
        tokio::spawn(async move {
            token.cancelled().await;
            broadcasting.retain(|_, owner| owner.generation != generation);
            tracing::info!(ws_id = %ws_id, generation, "broadcast cancelled");
        });
        generation
    }

    /// Adds entities subscribed after the broadcast of `generation` started.
    pub fn extend_broadcast(&self, ws_id: &str, generation: u64, base_ids: &[String]) {
        for base in base_ids {
            self.broadcasting.insert(
                base.to_lowercase(),
                BroadcastOwner {
                    ws_id: ws_id.to_string(),
                    generation,
                },
            );
        }
    }

    pub fn is_broadcasting(&self, base_id: &str) -> bool {
        self.broadcasting.contains_key(&base_id.to_lowercase())
    }

    /// Opens a time-boxed scope for a repeat loop on `base_id`, cancelling
    /// any loop still running for the same device.
    pub fn begin_repeat(&self, base_id: &str, parent: &CancellationToken) -> RepeatScope {
        let scope = RepeatScope {
            token: deadline_token(parent, self.options.repeat_command_timeout()),
            generation: self.next_generation(),
        };
        if let Some(previous) = self
            .repeat_commands
            .insert(base_id.to_lowercase(), scope.clone())
        {
            tracing::info!(entity_id = %base_id, "superseding running repeat command");
            previous.token.cancel();
        }
        scope
    }

    pub fn end_repeat(&self, base_id: &str, scope: &RepeatScope) {
        self.repeat_commands
            .remove_if(&base_id.to_lowercase(), |_, current| {
                current.generation == scope.generation
            });
        scope.token.cancel();
    }

    pub fn register_sensor_suffix(&self, base_id: &str, suffix: &str) {
        self.sensor_suffixes
            .entry(base_id.to_lowercase())
            .or_default()
            .insert(suffix.to_string());
    }

    pub fn sensor_suffixes(&self, base_id: &str) -> Vec<String> {
        self.sensor_suffixes
            .get(&base_id.to_lowercase())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn register_select_suffix(&self, base_id: &str, suffix: &str) {
        self.select_suffixes
            .entry(base_id.to_lowercase())
            .or_default()
            .insert(suffix.to_string());
    }

    pub fn select_suffixes(&self, base_id: &str) -> Vec<String> {
        self.select_suffixes
            .get(&base_id.to_lowercase())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_suffixes(&self, base_id: &str) {
        let key = base_id.to_lowercase();
        self.sensor_suffixes.remove(&key);
        self.select_suffixes.remove(&key);
    }
}

/// Child of `parent` that is also cancelled once `after` elapses.
pub fn deadline_token(parent: &CancellationToken, after: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(after) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}
