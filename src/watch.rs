//! Debounced filesystem watch loop.
//!
//! One listener per watched root plus one policy-file listener feed a
//! shared bounded channel; a single consumer drains it, coalescing
//! bursts of events into pending add/remove sets and a policy-dirty
//! flag. The pipeline is invoked only once the time since the last
//! observed event exceeds the debounce interval and there is pending
//! work. A policy reload takes priority at flush time: it clears the
//! pending sets, since reconciliation recomputes the full diff itself.
//! On shutdown any remaining pending work is flushed through one final
//! cycle.
//!
//! The loop is driven purely by channel messages, so tests feed
//! synthetic events without touching the real filesystem.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::models::normalize_path;
use crate::pipeline;

/// Shared event queue capacity.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Coalesced event kinds. Renames are synthesized by the listeners as
/// `Remove(old)` + `Add(new)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Add(String),
    Remove(String),
    PolicyReload,
}

/// What the loop invokes on flush; implemented by the engine and by test
/// doubles.
#[async_trait]
pub trait WatchHandler: Send + Sync {
    async fn process(&self, add_paths: HashSet<String>, remove_paths: HashSet<String>)
        -> Result<()>;
    async fn policy_change(&self) -> Result<()>;
}

#[async_trait]
impl WatchHandler for Arc<Engine> {
    async fn process(
        &self,
        add_paths: HashSet<String>,
        remove_paths: HashSet<String>,
    ) -> Result<()> {
        pipeline::process(self, &add_paths, &remove_paths).await?;
        Ok(())
    }

    async fn policy_change(&self) -> Result<()> {
        pipeline::handle_policy_change(self).await?;
        Ok(())
    }
}

/// Debounce accumulator: pending work plus the instant of the last
/// observed event.
#[derive(Default)]
struct DebounceState {
    pending_add: HashSet<String>,
    pending_remove: HashSet<String>,
    policy_dirty: bool,
    last_event: Option<Instant>,
}

impl DebounceState {
    fn observe(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Add(path) => {
                self.pending_remove.remove(&path);
                self.pending_add.insert(path);
            }
            WatchEvent::Remove(path) => {
                self.pending_add.remove(&path);
                self.pending_remove.insert(path);
            }
            WatchEvent::PolicyReload => self.policy_dirty = true,
        }
        self.last_event = Some(Instant::now());
    }

    fn has_work(&self) -> bool {
        self.policy_dirty || !self.pending_add.is_empty() || !self.pending_remove.is_empty()
    }

    fn quiet_for(&self, debounce: Duration) -> bool {
        self.last_event
            .map(|t| t.elapsed() >= debounce)
            .unwrap_or(false)
    }
}

/// Run the watch loop until the event channel closes. Per-cycle errors
/// are logged and the loop continues; it never exits because one
/// pipeline invocation failed.
pub async fn run_loop<H: WatchHandler>(
    mut rx: mpsc::Receiver<WatchEvent>,
    debounce: Duration,
    handler: H,
) {
    let mut state = DebounceState::default();
    // Poll granularity for the quiet-period check.
    let tick = debounce.min(Duration::from_millis(200)).max(Duration::from_millis(10));

    loop {
        let received = tokio::time::timeout(tick, rx.recv()).await;
        match received {
            Ok(Some(event)) => {
                debug!("watch event: {:?}", event);
                state.observe(event);
            }
            Ok(None) => {
                // Channel closed: flush remaining work, then exit.
                if state.has_work() {
                    flush(&mut state, &handler).await;
                }
                info!("watch loop shutting down");
                return;
            }
            Err(_) => {
                if state.has_work() && state.quiet_for(debounce) {
                    flush(&mut state, &handler).await;
                }
            }
        }
    }
}

async fn flush<H: WatchHandler>(state: &mut DebounceState, handler: &H) {
    let policy_dirty = state.policy_dirty;
    let adds = std::mem::take(&mut state.pending_add);
    let removes = std::mem::take(&mut state.pending_remove);
    state.policy_dirty = false;
    state.last_event = None;

    // A policy reload performs its own full reconciliation, so pending
    // add/remove sets are superseded.
    let result = if policy_dirty {
        handler.policy_change().await
    } else {
        handler.process(adds, removes).await
    };
    if let Err(e) = result {
        error!("watch cycle failed (continuing): {:#}", e);
    }
}

/// Spawn one OS listener per watched root plus one for the policy file,
/// all feeding `tx`. Listeners run on dedicated threads owned by the
/// returned watchers; dropping them stops the feed.
pub fn spawn_listeners(
    roots: &[PathBuf],
    policy_path: Option<&Path>,
    tx: mpsc::Sender<WatchEvent>,
) -> Result<Vec<RecommendedWatcher>> {
    let mut watchers = Vec::new();

    for root in roots {
        let tx_root = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    for translated in translate_event(&event) {
                        if let Err(e) = tx_root.blocking_send(translated) {
                            warn!("watch queue closed; dropping event: {}", e);
                        }
                    }
                }
                Err(e) => warn!("watcher error: {}", e),
            },
            notify::Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!("watching {}", root.display());
        watchers.push(watcher);
    }

    if let Some(policy) = policy_path {
        let tx_policy = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Access(_)) {
                        if let Err(e) = tx_policy.blocking_send(WatchEvent::PolicyReload) {
                            warn!("watch queue closed; dropping policy event: {}", e);
                        }
                    }
                }
                Err(e) => warn!("policy watcher error: {}", e),
            },
            notify::Config::default(),
        )?;
        // Watch the parent so atomic replace (write temp + rename) of
        // the policy file is still observed.
        let target = policy.parent().unwrap_or(policy);
        watcher.watch(target, RecursiveMode::NonRecursive)?;
        info!("watching policy file {}", policy.display());
        watchers.push(watcher);
    }

    Ok(watchers)
}

/// Map an OS event to coalescable watch events. A rename carrying both
/// paths becomes `Remove(old)` + `Add(new)`.
fn translate_event(event: &Event) -> Vec<WatchEvent> {
    let paths: Vec<String> = event
        .paths
        .iter()
        .filter_map(|p| normalize_path(&p.to_string_lossy()))
        .collect();
    if paths.is_empty() {
        return Vec::new();
    }
    match &event.kind {
        EventKind::Create(_) | EventKind::Modify(notify::event::ModifyKind::Data(_))
        | EventKind::Modify(notify::event::ModifyKind::Any) => {
            paths.into_iter().map(WatchEvent::Add).collect()
        }
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if paths.len() == 2 {
                vec![
                    WatchEvent::Remove(paths[0].clone()),
                    WatchEvent::Add(paths[1].clone()),
                ]
            } else {
                // Single-path rename halves: existence decides the kind.
                paths
                    .into_iter()
                    .map(|p| {
                        if Path::new(&p).exists() {
                            WatchEvent::Add(p)
                        } else {
                            WatchEvent::Remove(p)
                        }
                    })
                    .collect()
            }
        }
        EventKind::Remove(_) => paths.into_iter().map(WatchEvent::Remove).collect(),
        _ => Vec::new(),
    }
}
