//! Route event engine
//!
//! The RtnlEngine is responsible for:
//! - Subscribing to a [`RouteFeed`]
//! - Handing every event to the [`RouteWatcher`], one at a time
//! - Reporting feed loss distinctly from shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  RouteFeed  │─── RouteEvent ───┐
//! └─────────────┘                  │
//!                                  ▼
//!                         ┌──────────────┐
//!                         │  RtnlEngine  │
//!                         └──────────────┘
//!                                  │
//!                ┌─────────────────┴─────────────────┐
//!                ▼                                   ▼
//!        ┌──────────────┐                    ┌─────────────┐
//!        │ RouteWatcher │                    │   Events    │
//!        │ (dispatch)   │                    │  (notify)   │
//!        └──────────────┘                    └─────────────┘
//! ```
//!
//! ## Event Flow
//!
//! 1. Read one event from the feed
//! 2. Dispatch it synchronously: per-index watches, then observers
//! 3. Emit a [`EngineEvent::Dispatched`] summary for monitoring
//! 4. Read the next event
//!
//! Dispatch of one event always completes before the next is read, so
//! consumers see events in kernel order.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::rtnl::RouteWatcher;
use crate::traits::{RouteEvent, RouteEventKind, RouteFeed};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Events emitted by the RtnlEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine subscribed to its feed
    Started {
        feed: String,
    },

    /// One route event was delivered
    Dispatched {
        kind: RouteEventKind,
        index: u32,
        watches: usize,
        observers: usize,
    },

    /// The feed failed or ended; the engine has returned an error
    FeedLost {
        reason: String,
    },

    /// Engine stopped on request
    Stopped {
        reason: String,
    },
}

/// Drives a [`RouteFeed`] into a [`RouteWatcher`]
///
/// ## Lifecycle
///
/// 1. Create with [`RtnlEngine::new()`]
/// 2. Start with [`RtnlEngine::run()`] or [`RtnlEngine::run_until()`]
/// 3. The engine runs until shutdown, or until the feed is lost
/// 4. On feed loss, calling `run*` again resubscribes
///
/// ## Threading
///
/// Callbacks run inline on the engine's task. A watcher that needs to
/// do slow work must hand it off (spawn or send on a channel) instead
/// of blocking dispatch.
pub struct RtnlEngine {
    /// Source of kernel notifications
    feed: Box<dyn RouteFeed>,

    /// Fan-out target
    watcher: Arc<RouteWatcher>,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<EngineEvent>,
}

impl RtnlEngine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        feed: Box<dyn RouteFeed>,
        watcher: Arc<RouteWatcher>,
        config: &EngineConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let engine = Self {
            feed,
            watcher,
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// The watcher this engine dispatches into
    pub fn watcher(&self) -> &Arc<RouteWatcher> {
        &self.watcher
    }

    /// Run until SIGINT
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error::FeedLost)`: The feed failed or ended
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
            }
        })
        .await
    }

    /// Run with a programmatic shutdown channel
    ///
    /// With `None` this behaves like [`run()`](Self::run). Dropping the
    /// sender counts as a shutdown request.
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        match shutdown_rx {
            Some(rx) => {
                self.run_until(async {
                    let _ = rx.await;
                })
                .await
            }
            None => self.run().await,
        }
    }

    /// Run until `shutdown` completes
    ///
    /// The future is only polled, never consumed, when the feed is lost,
    /// so a pinned `&mut` future can be passed again to resubscribe.
    /// Losing the feed also clears the watcher's link cache; the next
    /// subscription is expected to learn the links again.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future,
    {
        info!(feed = self.feed.name(), "Subscribing to route feed");
        self.emit_event(EngineEvent::Started {
            feed: self.feed.name().to_string(),
        });

        let mut stream = self.feed.watch();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(event)) => self.deliver(&event),
                    Some(Err(e)) => {
                        error!(feed = self.feed.name(), "Route feed failed: {}", e);
                        self.watcher.reset_links();
                        self.emit_event(EngineEvent::FeedLost {
                            reason: e.to_string(),
                        });
                        return Err(match e {
                            Error::FeedLost(_) => e,
                            other => Error::feed_lost(other.to_string()),
                        });
                    }
                    None => {
                        warn!(feed = self.feed.name(), "Route feed ended");
                        self.watcher.reset_links();
                        self.emit_event(EngineEvent::FeedLost {
                            reason: "stream ended".to_string(),
                        });
                        return Err(Error::feed_lost(format!(
                            "{} stream ended",
                            self.feed.name()
                        )));
                    }
                },

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    self.emit_event(EngineEvent::Stopped {
                        reason: "Shutdown signal".to_string(),
                    });
                    break;
                }
            }
        }

        Ok(())
    }

    fn deliver(&self, event: &RouteEvent) {
        debug!(kind = ?event.kind(), index = event.index(), "Route event received");
        let summary = self.watcher.dispatch(event);
        self.emit_event(EngineEvent::Dispatched {
            kind: event.kind(),
            index: event.index(),
            watches: summary.watches,
            observers: summary.observers,
        });
    }

    /// Emit an engine event
    fn emit_event(&self, event: EngineEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Engine event channel full or closed, dropping event");
        }
    }
}
